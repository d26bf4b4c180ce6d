//! Conditional-request validator collaborator.
//!
//! A pure collaborator interface, with an in-memory reference
//! implementation so the crate is testable without a host-supplied store.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::entry::Validators;

/// Stores/retrieves validators for conditional revalidation independent of
/// the cache entry's own lifecycle — validator records may outlive their
/// cache entry, at the collaborator's discretion.
pub trait ConditionalStateStore: Send + Sync {
    /// Returns known validators for `key`, if any.
    fn try_get_validators(&self, key: &str) -> Option<Validators>;
    /// Records validators observed for `key`.
    fn set_validators(&self, key: &str, validators: Validators);
}

/// A `Mutex<HashMap<...>>`-backed reference implementation.
#[derive(Default)]
pub struct InMemoryConditionalStateStore {
    validators: Mutex<HashMap<String, Validators>>,
}

impl InMemoryConditionalStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConditionalStateStore for InMemoryConditionalStateStore {
    fn try_get_validators(&self, key: &str) -> Option<Validators> {
        self.validators.lock().get(key).cloned()
    }

    fn set_validators(&self, key: &str, validators: Validators) {
        self.validators.lock().insert(key.to_string(), validators);
    }
}
