use std::collections::HashMap;
use std::sync::Arc;

use super::capability::{SourceFetcher, StorageBackend};

/// Fetcher and storage pairing for one task kind.
#[derive(Clone)]
pub struct KindHandler {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub storage: Arc<dyn StorageBackend>,
}

/// Task kinds known to a scheduler, resolved once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, KindHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`, replacing any previous pairing for it.
    pub fn with_kind(
        mut self,
        kind: impl Into<String>,
        fetcher: Arc<dyn SourceFetcher>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        self.handlers
            .insert(kind.into(), KindHandler { fetcher, storage });
        self
    }

    pub fn get(&self, kind: &str) -> Option<&KindHandler> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
