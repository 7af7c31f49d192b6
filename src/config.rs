use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Maximum size for the active memtable before freezing (default: 64MB)
    pub memtable_size_bytes: usize,

    /// Maximum number of frozen memtables awaiting flush (default: 8)
    pub max_frozen_memtables: usize,

    /// Target size for SSTable files produced by flush and compaction
    /// (default: 32MB)
    pub sstable_size_bytes: usize,

    /// Approximate number of entries per data block (sizing hint for the
    /// bloom filter, default: 4096-byte blocks)
    pub block_size_bytes: usize,

    /// How often to check for flush opportunities (default: 50ms)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 200ms)
    pub compaction_interval: Duration,

    /// How often to retry deletion of superseded SSTable files (default: 1s)
    pub cleanup_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of levels below level 0 (default: 6)
    pub max_levels: usize,

    /// Minimum number of level-0 tables before L0 is considered for
    /// compaction (default: 4)
    pub level0_files_compaction_trigger: usize,

    /// Size-ratio percentage threshold. Level N is compacted into level N+1
    /// when `count(N+1) / count(N) * 100` falls below this value
    /// (default: 200)
    pub level_size_ratio_percentage: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_levels: 6,
            level0_files_compaction_trigger: 4,
            level_size_ratio_percentage: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            memtable_size_bytes: 64 * 1024 * 1024,
            max_frozen_memtables: 8,
            sstable_size_bytes: 32 * 1024 * 1024,
            block_size_bytes: 4096,
            flush_interval: Duration::from_millis(50),
            compaction_interval: Duration::from_millis(200),
            cleanup_interval: Duration::from_secs(1),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum active memtable size
    pub fn memtable_size_bytes(mut self, size: usize) -> Self {
        self.memtable_size_bytes = size;
        self
    }

    /// Set the frozen memtable limit
    pub fn max_frozen_memtables(mut self, count: usize) -> Self {
        self.max_frozen_memtables = count;
        self
    }

    /// Set target SSTable size
    pub fn sstable_size_bytes(mut self, size: usize) -> Self {
        self.sstable_size_bytes = size;
        self
    }

    /// Set the data block size
    pub fn block_size_bytes(mut self, size: usize) -> Self {
        self.block_size_bytes = size;
        self
    }

    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set superseded-table cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }
}

impl CompactionConfig {
    /// Set the number of levels below level 0
    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    /// Set the level-0 table count trigger
    pub fn level0_files_compaction_trigger(mut self, count: usize) -> Self {
        self.level0_files_compaction_trigger = count;
        self
    }

    /// Set the inter-level size-ratio percentage threshold
    pub fn level_size_ratio_percentage(mut self, percentage: usize) -> Self {
        self.level_size_ratio_percentage = percentage;
        self
    }
}
