use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde_json::Value;

use crate::{coerce, Reason, ResolutionDetails};

/// A raw flag value as last reported by a vendor, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawFlag {
    pub value: Value,
    pub variant: Option<String>,
    pub reason: Reason,
}

impl RawFlag {
    pub fn new(value: Value, reason: Reason) -> Self {
        RawFlag {
            value,
            variant: None,
            reason,
        }
    }
}

pub(crate) type FlagSnapshot = HashMap<String, RawFlag>;

/// `FlagStore` holds the latest flag snapshot of a provider. Writers (initialization, context
/// changes, realtime pushes) swap in a whole new snapshot; resolver calls read it concurrently.
pub(crate) struct FlagStore {
    snapshot: RwLock<Arc<FlagSnapshot>>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<FlagSnapshot> {
        // A poisoned lock only means a writer panicked mid-swap; the Arc inside is still whole.
        match self.snapshot.read() {
            Ok(snapshot) => Arc::clone(&*snapshot),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Replace the snapshot, returning the keys whose raw value changed.
    pub fn replace(&self, flags: FlagSnapshot) -> Vec<String> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(flags);
        let previous = {
            let mut slot = match self.snapshot.write() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *slot, Arc::clone(&new_value))
        };
        changed_keys(&previous, &new_value)
    }

    pub fn resolve_boolean(&self, flag_key: &str, default_value: bool) -> ResolutionDetails<bool> {
        self.resolve(flag_key, default_value, coerce::as_boolean)
    }

    pub fn resolve_string(&self, flag_key: &str, default_value: &str) -> ResolutionDetails<String> {
        self.resolve(flag_key, default_value.to_owned(), coerce::as_string)
    }

    pub fn resolve_number(&self, flag_key: &str, default_value: f64) -> ResolutionDetails<f64> {
        self.resolve(flag_key, default_value, coerce::as_number)
    }

    pub fn resolve_object(&self, flag_key: &str, default_value: &Value) -> ResolutionDetails<Value> {
        self.resolve(flag_key, default_value.clone(), coerce::as_object)
    }

    fn resolve<T>(
        &self,
        flag_key: &str,
        default_value: T,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> ResolutionDetails<T> {
        let snapshot = self.snapshot();
        let Some(flag) = snapshot.get(flag_key) else {
            log::trace!(target: "flagswitch", flag_key; "flag not found, using default");
            return ResolutionDetails::default_value(default_value);
        };
        match convert(&flag.value) {
            Some(value) => {
                ResolutionDetails::with_reason(value, flag.reason).variant(flag.variant.clone())
            }
            None => {
                log::trace!(target: "flagswitch", flag_key; "flag value has the wrong type, using default");
                ResolutionDetails::default_value(default_value)
            }
        }
    }
}

fn changed_keys(previous: &FlagSnapshot, current: &FlagSnapshot) -> Vec<String> {
    let mut changed: Vec<String> = current
        .iter()
        .filter(|(key, flag)| previous.get(*key).map(|p| &p.value) != Some(&flag.value))
        .map(|(key, _)| key.clone())
        .chain(
            previous
                .keys()
                .filter(|key| !current.contains_key(*key))
                .cloned(),
        )
        .collect();
    changed.sort();
    changed
}
