//! Configuration for sackdb
//!
//! Centralized configuration with sensible defaults.

/// Main configuration shared by the incoming buffer, the aggregate store and workers
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Sack Configuration
    // -------------------------------------------------------------------------
    /// Sack count written by `ensure_storage_settings` when none is stored yet.
    /// The stored value, not this one, is authoritative once it exists.
    pub default_sack_count: u32,

    /// Arm a sack marker on every append so idle workers get woken up
    pub greedy: bool,

    // -------------------------------------------------------------------------
    // Key Layout
    // -------------------------------------------------------------------------
    /// Separator between the parts of composite keys
    ///   {sack name}{sep}{metric id}      (incoming queues)
    ///   {storage prefix}{sep}{metric id} (aggregate namespaces)
    pub key_separator: String,

    /// Hash key holding cluster-wide settings
    pub config_key: String,

    /// Field of `config_key` holding the sack count
    pub sacks_field: String,

    /// Prefix of per-metric aggregate namespaces
    pub storage_prefix: String,

    /// Format version used when callers don't pick one explicitly
    pub format_version: u32,

    // -------------------------------------------------------------------------
    // Backend Interaction
    // -------------------------------------------------------------------------
    /// Commands per pipeline when building reports
    pub report_batch_size: usize,

    /// COUNT hint passed to every SCAN/HSCAN page
    pub scan_count: usize,

    /// Database index, part of keyspace notification channels
    pub database: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_sack_count: 128,
            greedy: true,
            key_separator: ":".to_string(),
            config_key: "gnocchi-config".to_string(),
            sacks_field: "sacks".to_string(),
            storage_prefix: "timeseries".to_string(),
            format_version: 3,
            report_batch_size: 100,
            scan_count: 1000,
            database: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Prefix of keyspace notification channels for the configured database
    pub fn keyspace_prefix(&self) -> String {
        format!("__keyspace@{}__:", self.database)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the sack count used when the cluster has none stored yet
    pub fn default_sack_count(mut self, count: u32) -> Self {
        self.config.default_sack_count = count;
        self
    }

    /// Enable or disable marker arming on append
    pub fn greedy(mut self, greedy: bool) -> Self {
        self.config.greedy = greedy;
        self
    }

    /// Set the composite key separator
    pub fn key_separator(mut self, sep: impl Into<String>) -> Self {
        self.config.key_separator = sep.into();
        self
    }

    /// Set the settings hash key
    pub fn config_key(mut self, key: impl Into<String>) -> Self {
        self.config.config_key = key.into();
        self
    }

    /// Set the aggregate namespace prefix
    pub fn storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.storage_prefix = prefix.into();
        self
    }

    /// Set the default aggregate format version
    pub fn format_version(mut self, version: u32) -> Self {
        self.config.format_version = version;
        self
    }

    /// Set how many commands a report pipeline carries
    pub fn report_batch_size(mut self, size: usize) -> Self {
        self.config.report_batch_size = size;
        self
    }

    /// Set the SCAN/HSCAN page size hint
    pub fn scan_count(mut self, count: usize) -> Self {
        self.config.scan_count = count;
        self
    }

    /// Set the database index used in notification channels
    pub fn database(mut self, db: u32) -> Self {
        self.config.database = db;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
