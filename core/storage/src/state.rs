//! Saved-state cell tracking credential drift for one adapter instance.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use unidrive_common::Result;

/// State that must be written back to the credential store.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    /// The full saved-state document after the change.
    pub saved: Value,
    /// Last log line recorded by the adapter, if any.
    pub log: Option<String>,
}

/// Holds an adapter's opaque saved state and remembers whether it changed.
///
/// The cell is shared (behind `Arc`) between an adapter and the token manager
/// it owns, so a refresh that rotates credentials in the middle of an
/// operation is still captured when the request flushes its drift.
#[derive(Debug, Default)]
pub struct StateCell {
    saved: RwLock<Value>,
    changed: AtomicBool,
    log: RwLock<Option<String>>,
}

impl StateCell {
    /// Create a cell hydrated from persisted state.
    pub fn new(saved: Value) -> Self {
        Self {
            saved: RwLock::new(saved),
            changed: AtomicBool::new(false),
            log: RwLock::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.saved.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Value> {
        self.saved.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current saved-state document.
    pub fn snapshot(&self) -> Value {
        self.read().clone()
    }

    /// Read one typed field of the saved state.
    ///
    /// Returns `Ok(None)` when the field is absent or null.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let saved = self.read();
        match saved.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Write one typed field; marks the cell changed only if the value differs.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut saved = self.write();
        if !saved.is_object() {
            *saved = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut *saved {
            if map.get(key) == Some(&value) {
                return Ok(());
            }
            map.insert(key.to_string(), value);
        }
        self.changed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the state changed since hydration or the last flush.
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Record a log line to persist alongside the state.
    pub fn set_log(&self, line: impl Into<String>) {
        *self.log.write().unwrap_or_else(|e| e.into_inner()) = Some(line.into());
    }

    /// Last recorded log line.
    pub fn log(&self) -> Option<String> {
        self.log.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take pending drift, clearing the changed flag.
    ///
    /// Returns `None` when nothing changed, so callers write at most once per
    /// change no matter how many times they flush.
    pub fn take_drift(&self) -> Option<Drift> {
        if !self.changed.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(Drift {
            saved: self.snapshot(),
            log: self.log(),
        })
    }

    /// Put the changed flag back after a failed write-back.
    pub fn restore_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_marks_changed_once() {
        let cell = StateCell::new(json!({"token": "a"}));
        assert!(!cell.is_changed());

        cell.set("token", &"a").unwrap();
        assert!(!cell.is_changed(), "identical value must not count as drift");

        cell.set("token", &"b").unwrap();
        assert!(cell.is_changed());

        let drift = cell.take_drift().unwrap();
        assert_eq!(drift.saved, json!({"token": "b"}));
        assert!(cell.take_drift().is_none());
    }

    #[test]
    fn test_set_on_null_state_creates_object() {
        let cell = StateCell::new(Value::Null);
        cell.set("tier", &2).unwrap();
        assert_eq!(cell.get::<u32>("tier").unwrap(), Some(2));
    }

    #[test]
    fn test_get_missing_field() {
        let cell = StateCell::new(json!({}));
        assert_eq!(cell.get::<String>("missing").unwrap(), None);
    }

    #[test]
    fn test_log_is_carried_in_drift() {
        let cell = StateCell::new(json!({}));
        cell.set_log("token refreshed");
        cell.set("k", &1).unwrap();
        let drift = cell.take_drift().unwrap();
        assert_eq!(drift.log.as_deref(), Some("token refreshed"));
    }

    #[test]
    fn test_restore_changed() {
        let cell = StateCell::new(json!({}));
        cell.set("k", &1).unwrap();
        let _ = cell.take_drift();
        cell.restore_changed();
        assert!(cell.is_changed());
    }
}
