//! Operation store: job id to lifecycle record.
//!
//! Backed by a DashMap so request handlers, executors and the expiry sweep
//! can touch different jobs without a global lock.

use std::time::Duration;

use dashmap::DashMap;

use crate::operation::{JobId, Operation, OperationMetadata, OperationState};

#[derive(Default)]
pub struct OperationStore {
    operations: DashMap<JobId, Operation>,
}

impl OperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, operation: Operation) {
        self.operations
            .insert(operation.id().to_string(), operation);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.operations.get(id).map(|op| op.clone())
    }

    pub fn state(&self, id: &str) -> Option<OperationState> {
        self.operations.get(id).map(|op| op.state())
    }

    pub fn metadata(&self, id: &str) -> Option<OperationMetadata> {
        self.operations.get(id).map(|op| op.metadata())
    }

    /// Apply `f` to the operation if it exists.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Operation) -> R) -> Option<R> {
        self.operations.get_mut(id).map(|mut op| f(&mut op))
    }

    pub fn remove(&self, id: &str) -> Option<Operation> {
        self.operations.remove(id).map(|(_, op)| op)
    }

    /// Drop every operation older than `max_age`, whatever its state.
    pub fn remove_expired(&self, max_age: Duration) -> Vec<Operation> {
        let mut removed = Vec::new();
        self.operations.retain(|_, op| {
            if op.age() > max_age {
                removed.push(op.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
