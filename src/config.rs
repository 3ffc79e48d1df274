use std::path::PathBuf;

/// Configuration for a jotdb store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database. SSTables live under `<dir>/sst`.
    pub dir: PathBuf,

    /// JSON attribute the primary key is derived from. Required.
    pub primary_key: String,

    /// JSON attribute indexed secondarily. Empty disables all secondary
    /// machinery: no inverted lists, no secondary filter blocks, no interval
    /// metadata, and `sget`/`srange` fail with InvalidArgument.
    pub secondary_key: String,

    /// Checkpoint file for the interval tree. Non-empty selects interval
    /// tree mode; empty selects interval-block mode (per-block ranges are
    /// written inside each SSTable instead). Relative paths resolve under
    /// `dir`.
    pub interval_tree_file_name: String,

    /// Target size for a data block before it is cut (default: 4KB).
    pub block_size: usize,

    /// Maximum size for the active write buffer before freezing (default: 4MB).
    pub max_buffer_size: usize,

    /// Bloom filter bits per key, shared by the primary and secondary
    /// filters. 0 omits both filter blocks (default: 10).
    pub filter_bits_per_key: usize,

    /// Interval tree mutations between checkpoints (default: 10,000).
    pub sync_threshold: u32,

    /// Delimiter between the file-number prefix and the block-key suffix in
    /// interval tree ids (default: '+').
    pub id_delim: char,

    /// Verify block checksums on every read, not just meta blocks.
    pub paranoid_checks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./jotdb"),
            primary_key: String::new(),
            secondary_key: String::new(),
            interval_tree_file_name: String::new(),
            block_size: 4 * 1024,
            max_buffer_size: 4 * 1024 * 1024,
            filter_bits_per_key: 10,
            sync_threshold: 10_000,
            id_delim: '+',
            paranoid_checks: false,
        }
    }
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the primary key attribute.
    pub fn primary_key(mut self, attr: impl Into<String>) -> Self {
        self.primary_key = attr.into();
        self
    }

    /// Set the secondary key attribute.
    pub fn secondary_key(mut self, attr: impl Into<String>) -> Self {
        self.secondary_key = attr.into();
        self
    }

    /// Enable interval tree mode with the given checkpoint file name.
    pub fn interval_tree_file_name(mut self, name: impl Into<String>) -> Self {
        self.interval_tree_file_name = name.into();
        self
    }

    /// Set the target data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the write buffer freeze threshold.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set bloom filter bits per key (0 disables filters).
    pub fn filter_bits_per_key(mut self, bits: usize) -> Self {
        self.filter_bits_per_key = bits;
        self
    }

    /// Set the interval tree checkpoint threshold.
    pub fn sync_threshold(mut self, threshold: u32) -> Self {
        self.sync_threshold = threshold;
        self
    }

    /// Set the interval tree id delimiter.
    pub fn id_delim(mut self, delim: char) -> Self {
        self.id_delim = delim;
        self
    }

    /// Enable checksum verification on all block reads.
    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    /// True when the interval tree drives secondary queries.
    pub fn interval_tree_mode(&self) -> bool {
        !self.interval_tree_file_name.is_empty()
    }

    /// True when secondary indexing is enabled at all.
    pub fn secondary_enabled(&self) -> bool {
        !self.secondary_key.is_empty()
    }

    /// Absolute path of the interval tree checkpoint file.
    pub fn interval_tree_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.interval_tree_file_name);
        if path.is_absolute() {
            path
        } else {
            self.dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.block_size, 4 * 1024);
        assert_eq!(config.filter_bits_per_key, 10);
        assert_eq!(config.sync_threshold, 10_000);
        assert_eq!(config.id_delim, '+');
        assert!(!config.interval_tree_mode());
        assert!(!config.secondary_enabled());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .primary_key("id")
            .secondary_key("age")
            .interval_tree_file_name("interval.str")
            .block_size(512)
            .sync_threshold(2);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert!(config.interval_tree_mode());
        assert!(config.secondary_enabled());
        assert_eq!(config.interval_tree_path(), PathBuf::from("/tmp/test/interval.str"));
        assert_eq!(config.sync_threshold, 2);
    }
}
