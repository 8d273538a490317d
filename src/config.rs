use std::path::{Path, PathBuf};

const DEFAULT_ROOT_PATH: &str = "trellis";

/// Dirty-page ceiling for batch-mode opens before a flush is forced.
const DEFAULT_BATCH_MAX_PAGE_CACHE: usize = 20;

pub struct DBConfig {
    pub cache_capacity: usize,
    pub root_path: PathBuf,
    pub batch_max_page_cache: usize,
}

impl Default for DBConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            batch_max_page_cache: DEFAULT_BATCH_MAX_PAGE_CACHE,
        }
    }
}

impl DBConfig {
    pub fn new() -> Self {
        DBConfig::default()
    }

    pub fn root_path<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.root_path = p.as_ref().to_path_buf();
        self
    }

    pub fn cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn batch_max_page_cache(mut self, limit: usize) -> Self {
        self.batch_max_page_cache = limit;
        self
    }

    pub fn get_storage_path(&self) -> PathBuf {
        let mut path = self.root_path.clone();
        path.push("base");
        path
    }
}
