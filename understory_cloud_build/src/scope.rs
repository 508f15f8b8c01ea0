// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Resources shared between the builders of one logical index.

use std::sync::Arc;

use understory_cloud::{Schema, Storage};

/// Storage and decoded schema handed from one subset builder to the next.
///
/// The first index opened through a scope records its schema; later opens whose
/// stored schema matches reuse that same allocation.
#[derive(Clone, Debug)]
pub struct OuterScope {
    storage: Arc<dyn Storage>,
    schema: Option<Arc<Schema>>,
}

impl OuterScope {
    /// A scope over `storage` with nothing shared yet.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            schema: None,
        }
    }

    /// Share `schema` with everything opened through this scope.
    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The shared schema, if one has been recorded.
    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    /// Record `schema` unless one is already shared.
    pub fn share(&mut self, schema: &Arc<Schema>) {
        if self.schema.is_none() {
            self.schema = Some(schema.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use understory_cloud::MemoryStorage;

    use super::*;

    #[test]
    fn first_schema_wins() {
        let mut scope = OuterScope::new(Arc::new(MemoryStorage::new()));
        assert!(scope.schema().is_none());
        let a = Arc::new(Schema::xyz([]));
        let b = Arc::new(Schema::xyz([]));
        scope.share(&a);
        scope.share(&b);
        assert!(Arc::ptr_eq(scope.schema().unwrap(), &a));
        let replaced = scope.with_schema(b.clone());
        assert!(Arc::ptr_eq(replaced.schema().unwrap(), &b));
    }
}
