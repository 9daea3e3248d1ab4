//! The storage interface every context shares.
//!
//! The real backing store lives outside this library (in the browser it is
//! `chrome.storage.local`); here we only fix the shape we rely on: JSON values
//! addressed by string keys, plus change notifications tagged with the area
//! they came from. `MemoryArea` is a complete in-process implementation used
//! by tests and by anything that wants to run without a browser.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use serde_json::Value;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Handle returned by [`StorageArea::subscribe`], used to unsubscribe.
    pub struct ChangeListenerKey;
}

/// Which storage area a change came from. Only [`Area::Local`] is consumed by
/// the sync layer; changes in other areas are someone else's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Area {
    Local,
    Session,
    Sync,
}

/// One mutation of the store, as reported to change listeners.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub area: Area,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for `{key}` has an unexpected shape")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Async key-value store with change notifications.
///
/// All persistence in this library goes through this trait. Implementations
/// are expected to be single-threaded (one per context) and to deliver change
/// notifications synchronously after a write completes.
pub trait StorageArea {
    fn area(&self) -> Area;

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;

    /// Registers a change listener. Listeners must not subscribe or
    /// unsubscribe from inside their own callback.
    fn subscribe(&self, listener: impl Fn(&StorageChange) + 'static) -> ChangeListenerKey;
    fn unsubscribe(&self, key: ChangeListenerKey);
}

/// In-memory [`StorageArea`]. Writes can be made to fail on demand, which is
/// how tests exercise the retry and rollback paths.
pub struct MemoryArea {
    area: Area,
    values: RefCell<BTreeMap<String, Value>>,
    listeners: RefCell<SlotMap<ChangeListenerKey, Box<dyn Fn(&StorageChange)>>>,
    failing_writes: Cell<u32>,
}

impl MemoryArea {
    pub fn new(area: Area) -> Self {
        Self {
            area,
            values: RefCell::new(BTreeMap::new()),
            listeners: RefCell::new(SlotMap::with_key()),
            failing_writes: Cell::new(0),
        }
    }

    /// Makes the next `n` writes (set/remove/clear) fail with
    /// [`StorageError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.set(n);
    }

    fn check_write(&self) -> Result<(), StorageError> {
        let remaining = self.failing_writes.get();
        if remaining > 0 {
            self.failing_writes.set(remaining - 1);
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn notify(&self, change: StorageChange) {
        for (_, listener) in self.listeners.borrow().iter() {
            listener(&change);
        }
    }
}

impl StorageArea for MemoryArea {
    fn area(&self) -> Area {
        self.area
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.check_write()?;
        let old_value = self.values.borrow_mut().insert(key.to_string(), value.clone());
        self.notify(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
            area: self.area,
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_write()?;
        let old_value = self.values.borrow_mut().remove(key);
        if old_value.is_some() {
            self.notify(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
                area: self.area,
            });
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_write()?;
        let drained = std::mem::take(&mut *self.values.borrow_mut());
        for (key, old_value) in drained {
            self.notify(StorageChange {
                key,
                old_value: Some(old_value),
                new_value: None,
                area: self.area,
            });
        }
        Ok(())
    }

    fn subscribe(&self, listener: impl Fn(&StorageChange) + 'static) -> ChangeListenerKey {
        self.listeners.borrow_mut().insert(Box::new(listener))
    }

    fn unsubscribe(&self, key: ChangeListenerKey) {
        self.listeners.borrow_mut().remove(key);
    }
}
