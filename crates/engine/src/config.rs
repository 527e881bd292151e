//! Volume configuration via `cowsnap.toml`
//!
//! Runtime options select the strategy behind each of the engine's variation
//! points and a few limits. Geometry is fixed at format time and lives in
//! [`FormatOptions`] instead.

use cowsnap_core::limits::DEFAULT_MAX_TRANSACTION_CREDITS;
use cowsnap_core::{Error, Geometry, Result, SnapshotId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "cowsnap.toml";

/// How synthesized COW bitmaps are remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitmapCacheMode {
    /// Remember each group's COW bitmap location in memory
    #[default]
    Cached,
    /// Look the location up in the snapshot map on every check
    Uncached,
}

/// How many snapshots may coexist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotListMode {
    /// Ordered list of many snapshots
    #[default]
    List,
    /// At most one snapshot at a time
    SingleSlot,
}

/// Per-transaction COW record strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CowCacheMode {
    /// Tag blocks with the id of the transaction that handled them
    #[default]
    Tid,
    /// No per-transaction records
    Disabled,
}

/// Runtime configuration loaded from `cowsnap.toml`.
///
/// # Example
///
/// ```toml
/// bitmap_cache = "cached"
/// snapshot_list = "list"
/// cow_cache = "tid"
/// cow_stats = false
/// reserve_check = true
/// read_only = false
/// max_transaction_credits = 8192
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// COW bitmap cache strategy
    #[serde(default)]
    pub bitmap_cache: BitmapCacheMode,
    /// Snapshot list strategy
    #[serde(default)]
    pub snapshot_list: SnapshotListMode,
    /// Per-transaction COW record strategy
    #[serde(default)]
    pub cow_cache: CowCacheMode,
    /// Collect per-handle COW counters
    #[serde(default)]
    pub cow_stats: bool,
    /// Refuse to take a snapshot without enough free space for its metadata
    #[serde(default = "default_true")]
    pub reserve_check: bool,
    /// Mount read-only: no handles, snapshots auto-enabled
    #[serde(default)]
    pub read_only: bool,
    /// Upper bound of buffer credits per handle
    #[serde(default = "default_max_transaction_credits")]
    pub max_transaction_credits: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_transaction_credits() -> u32 {
    DEFAULT_MAX_TRANSACTION_CREDITS
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bitmap_cache: BitmapCacheMode::default(),
            snapshot_list: SnapshotListMode::default(),
            cow_cache: CowCacheMode::default(),
            cow_stats: false,
            reserve_check: true,
            read_only: false,
            max_transaction_credits: DEFAULT_MAX_TRANSACTION_CREDITS,
        }
    }
}

impl VolumeConfig {
    /// Config suited to tests: counters on, no reserve check
    pub fn for_testing() -> Self {
        Self {
            cow_stats: true,
            reserve_check: false,
            ..Self::default()
        }
    }

    /// Set the bitmap cache strategy
    pub fn with_bitmap_cache(mut self, mode: BitmapCacheMode) -> Self {
        self.bitmap_cache = mode;
        self
    }

    /// Set the snapshot list strategy
    pub fn with_snapshot_list(mut self, mode: SnapshotListMode) -> Self {
        self.snapshot_list = mode;
        self
    }

    /// Set the per-transaction COW record strategy
    pub fn with_cow_cache(mut self, mode: CowCacheMode) -> Self {
        self.cow_cache = mode;
        self
    }

    /// Mount read-only
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the per-handle credit limit
    pub fn with_max_transaction_credits(mut self, credits: u32) -> Self {
        self.max_transaction_credits = credits;
        self
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.max_transaction_credits == 0 {
            return Err(Error::invalid_argument(
                "max_transaction_credits must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# cowsnap volume configuration
#
# COW bitmap cache: "cached" (default) or "uncached"
bitmap_cache = "cached"

# Snapshot list: "list" (many snapshots, default) or "single_slot"
snapshot_list = "list"

# Per-transaction COW records: "tid" (default) or "disabled"
cow_cache = "tid"

# Collect per-handle COW counters (default: false)
cow_stats = false

# Refuse to take a snapshot without room for its metadata (default: true)
reserve_check = true

# Mount read-only; snapshots are enabled automatically (default: false)
read_only = false

# Upper bound of buffer credits per transaction handle
max_transaction_credits = 8192
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// `IoError` if the file cannot be read, `InvalidArgument` if it does
    /// not parse or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VolumeConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_argument(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Format-time geometry and initial state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Block size in bytes
    pub block_size: usize,
    /// Total number of blocks
    pub blocks_count: u64,
    /// Last snapshot id handed out; the first snapshot gets the next one
    pub last_snapshot_id: SnapshotId,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_count: 32768,
            last_snapshot_id: SnapshotId::INVALID,
        }
    }
}

impl FormatOptions {
    /// Options for a volume of `blocks_count` blocks of `block_size` bytes
    pub fn new(block_size: usize, blocks_count: u64) -> Self {
        Self {
            block_size,
            blocks_count,
            ..Self::default()
        }
    }

    /// Start snapshot ids after `id`
    pub fn with_last_snapshot_id(mut self, id: SnapshotId) -> Self {
        self.last_snapshot_id = id;
        self
    }

    /// Validated geometry
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.block_size, self.blocks_count)
    }
}
