use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub watch_directory: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub performance: PerformanceConfig,
    pub log_files: Vec<LogFileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PerformanceConfig {
    /// Upper bound on queued records; a full queue blocks file readers.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Partial batches older than this are flushed regardless of size.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "default_cursor_gc_interval_secs")]
    pub cursor_gc_interval_secs: u64,
    #[serde(default = "default_watch_poll_interval_ms")]
    pub watch_poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogFileConfig {
    /// Regular expression tested against the file's base name, not the full path.
    pub file_pattern: String,
    pub table: String,
    pub field_mappings: Vec<FieldMappingConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FieldMappingConfig {
    pub source_field: String,
    pub target_field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Closed set of target types, resolved once at config load.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Datetime,
    Bool,
}

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_MAX_QUEUE_LENGTH: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 8;
const DEFAULT_CURSOR_GC_INTERVAL_SECS: u64 = 60;
const DEFAULT_WATCH_POLL_INTERVAL_MS: u64 = 500;

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_max_queue_length() -> usize {
    DEFAULT_MAX_QUEUE_LENGTH
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_max_concurrent_handlers() -> usize {
    DEFAULT_MAX_CONCURRENT_HANDLERS
}

fn default_cursor_gc_interval_secs() -> u64 {
    DEFAULT_CURSOR_GC_INTERVAL_SECS
}

fn default_watch_poll_interval_ms() -> u64 {
    DEFAULT_WATCH_POLL_INTERVAL_MS
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            cursor_gc_interval_secs: DEFAULT_CURSOR_GC_INTERVAL_SECS,
            watch_poll_interval_ms: DEFAULT_WATCH_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation of everything serde cannot express. Any error here
    /// is fatal at startup; the process must not proceed on a bad config.
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;

        let watch_dir = self.watch_directory_path();
        if !watch_dir.exists() {
            bail!("watch_directory does not exist: {}", watch_dir.display());
        }
        if !watch_dir.is_dir() {
            bail!("watch_directory is not a directory: {}", watch_dir.display());
        }

        if self.log_files.is_empty() {
            bail!("log_files cannot be empty");
        }
        for (idx, rule) in self.log_files.iter().enumerate() {
            rule.validate()
                .with_context(|| format!("invalid log_files entry #{idx}"))?;
        }

        if self.performance.max_queue_length == 0 {
            bail!("performance.max_queue_length must be at least 1");
        }
        if self.performance.batch_size == 0 {
            bail!("performance.batch_size must be at least 1");
        }
        if self.performance.max_concurrent_handlers == 0 {
            bail!("performance.max_concurrent_handlers must be at least 1");
        }

        Ok(())
    }

    pub fn watch_directory_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.watch_directory).into_owned())
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("database.port must be between 1 and 65535");
        }
        for (name, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("password", &self.password),
            ("database", &self.database),
        ] {
            if value.is_empty() {
                bail!("database.{name} cannot be empty");
            }
        }
        if self.pool_size == 0 {
            bail!("database.pool_size must be at least 1");
        }
        Ok(())
    }
}

impl LogFileConfig {
    fn validate(&self) -> Result<()> {
        if self.file_pattern.is_empty() {
            bail!("file_pattern cannot be empty");
        }
        Regex::new(&self.file_pattern)
            .with_context(|| format!("invalid regex in file_pattern {:?}", self.file_pattern))?;

        if !is_sql_identifier(&self.table) {
            bail!("table {:?} is not a valid identifier", self.table);
        }

        if self.field_mappings.is_empty() {
            bail!("field_mappings cannot be empty");
        }
        for mapping in &self.field_mappings {
            if mapping.source_field.is_empty() {
                bail!("source_field cannot be empty");
            }
            if !is_sql_identifier(&mapping.target_field) {
                bail!(
                    "target_field {:?} is not a valid identifier",
                    mapping.target_field
                );
            }
        }

        // Two mappings writing the same target column would be ambiguous.
        for (idx, mapping) in self.field_mappings.iter().enumerate() {
            let duplicate = self.field_mappings[..idx]
                .iter()
                .any(|earlier| earlier.target_field == mapping.target_field);
            if duplicate {
                bail!(
                    "duplicate target_field {:?} within one rule",
                    mapping.target_field
                );
            }
        }

        Ok(())
    }
}

/// Target tables and columns are interpolated into SQL as quoted identifiers,
/// so restrict them to a conservative charset at load time.
fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
