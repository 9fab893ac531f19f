//! Store configuration.

/// Default number of clean pages kept in the read cache.
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Options accepted when opening a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Capacity of the LRU read cache, in pages. Must be at least 1.
    pub cache_pages: usize,
    /// Whether commit calls `sync_all` on the log and the store file.
    pub sync_on_commit: bool,
    /// Upper bound on entries per index node. `None` means the node splits
    /// only when its bytes run out.
    pub max_node_entries: Option<usize>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_pages: DEFAULT_CACHE_PAGES,
            sync_on_commit: true,
            max_node_entries: None,
        }
    }
}

impl StoreOptions {
    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages.max(1);
        self
    }

    pub fn with_max_node_entries(mut self, entries: usize) -> Self {
        self.max_node_entries = Some(entries);
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }
}
