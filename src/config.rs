//! Runtime configuration for a backup run.
//!
//! [`Config`] holds every option `segbackup` needs, separated from the CLI
//! parsing concerns so the library can be driven directly from tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cluster::{SegmentHost, Transport, COORDINATOR_CONTENT_ID};
use crate::error::{BackupError, Result};

/// Prefix for every artifact and the process-match pattern.
pub const DEFAULT_TOOL_NAME: &str = "segbackup";

/// Connection options for the coordinator SQL session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub dbname: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    /// Verbosity level (0 = info, 1 = debug, 2+ = trace)
    pub verbosity: u8,
    /// Root for backup artifacts; `None` uses `<data_dir>/backups` on each host
    pub backup_dir: Option<PathBuf>,
    /// Cluster topology file (JSON)
    pub cluster_config: PathBuf,
    /// Catalog snapshot file (JSON)
    pub catalog: PathBuf,
    /// Qualified names to include (mutually exclusive with `exclude_tables`)
    pub include_tables: Vec<String>,
    /// Qualified names to exclude
    pub exclude_tables: Vec<String>,
    /// Capture non-external leaf partitions individually
    pub leaf_partition_data: bool,
    /// gzip level, 0 disables compression
    pub compression_level: u32,
    /// Replaces gzip with another stdin -> stdout filter
    pub compression_program: Option<String>,
    /// Storage plugin config (YAML)
    pub plugin_config: Option<PathBuf>,
    /// Segment-side command that writes relation data into `{pipe}`
    pub unload_command: String,
    /// Run timestamp, `None` means now
    pub timestamp: Option<String>,
    pub transport: Transport,
    pub connection: ConnectionConfig,
    /// Upper bound on the reader drain wait, `None` waits until they exit
    pub reader_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbosity: 0,
            backup_dir: None,
            cluster_config: PathBuf::from("cluster.json"),
            catalog: PathBuf::from("catalog.json"),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            leaf_partition_data: false,
            compression_level: 1,
            compression_program: None,
            plugin_config: None,
            unload_command: String::new(),
            timestamp: None,
            transport: Transport::Ssh,
            connection: ConnectionConfig::default(),
            reader_timeout_secs: None,
        }
    }
}

impl Config {
    /// Reject option combinations that can never produce a valid run.
    pub fn validate(&self) -> Result<()> {
        if !self.include_tables.is_empty() && !self.exclude_tables.is_empty() {
            return Err(BackupError::Config(
                "include and exclude table filters cannot be combined".to_string(),
            ));
        }
        let qualified = qualified_name_regex();
        for name in self.include_tables.iter().chain(self.exclude_tables.iter()) {
            if !qualified.is_match(name) {
                return Err(BackupError::Config(format!(
                    "table {name} is not a schema-qualified name"
                )));
            }
        }
        if self.compression_level > 9 {
            return Err(BackupError::Config(format!(
                "compression level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if let Some(timestamp) = &self.timestamp {
            if !Regex::new(r"^\d{14}$").map_or(false, |re| re.is_match(timestamp)) {
                return Err(BackupError::Config(format!(
                    "timestamp {timestamp} must be 14 digits (YYYYMMDDHHMMSS)"
                )));
            }
        }
        if self.reader_timeout_secs == Some(0) {
            return Err(BackupError::Config(
                "reader timeout must be at least one second".to_string(),
            ));
        }
        if self.unload_command.trim().is_empty() {
            return Err(BackupError::Config(
                "an unload command is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn compression(&self) -> Option<Compression> {
        if self.compression_level == 0 {
            return None;
        }
        match &self.compression_program {
            Some(program) => {
                let name = program.split_whitespace().next().unwrap_or("z");
                let name = name.rsplit('/').next().unwrap_or(name);
                Some(Compression::custom(program.as_str(), format!(".{name}")))
            }
            None => Some(Compression::gzip(self.compression_level)),
        }
    }
}

/// `schema.name`, each part either a bare identifier or a double-quoted one.
pub fn qualified_name_regex() -> Regex {
    Regex::new(r#"^("[^"]+"|[^".]+)\.("[^"]+"|[^".]+)$"#).expect("static regex")
}

/// An external stdin -> stdout filter used on the reader side of each pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression {
    pub compress_command: String,
    /// Appended to the data file name, including the leading dot.
    pub extension: String,
}

impl Compression {
    pub fn gzip(level: u32) -> Self {
        Self {
            compress_command: format!("gzip -c -{level}"),
            extension: ".gz".to_string(),
        }
    }

    pub fn custom(compress_command: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            compress_command: compress_command.into(),
            extension: extension.into(),
        }
    }
}

/// Storage plugin configuration, loaded from the YAML file given on the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "executablepath")]
    pub executable_path: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Path of the YAML file itself; handed to the plugin on every call.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl PluginConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read plugin config {}: {e}", path.display()))
        })?;
        let mut config: PluginConfig = serde_yaml::from_str(&content).map_err(|e| {
            BackupError::Config(format!("cannot parse plugin config {}: {e}", path.display()))
        })?;
        if !config.executable_path.is_absolute() {
            return Err(BackupError::Config(format!(
                "plugin executable {} must be an absolute path",
                config.executable_path.display()
            )));
        }
        config.config_path = path.to_path_buf();
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
}

impl From<HostEntry> for SegmentHost {
    fn from(entry: HostEntry) -> Self {
        SegmentHost::new(entry.content_id, entry.hostname, entry.data_dir)
    }
}

/// Cluster topology: one coordinator plus the segments holding data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub coordinator: Option<HostEntry>,
    pub segments: Vec<HostEntry>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read cluster config {}: {e}", path.display()))
        })?;
        let config: ClusterConfig = serde_json::from_str(&content).map_err(|e| {
            BackupError::Config(format!("cannot parse cluster config {}: {e}", path.display()))
        })?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(BackupError::Config(
                "cluster config lists no segments".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for segment in &self.segments {
            if segment.content_id < 0 {
                return Err(BackupError::Config(format!(
                    "segment content id {} must be non-negative",
                    segment.content_id
                )));
            }
            if !seen.insert(segment.content_id) {
                return Err(BackupError::Config(format!(
                    "duplicate segment content id {}",
                    segment.content_id
                )));
            }
        }
        Ok(())
    }

    /// The coordinator entry, defaulting to this machine.
    pub fn coordinator_host(&self) -> SegmentHost {
        match &self.coordinator {
            Some(entry) => SegmentHost::new(
                COORDINATOR_CONTENT_ID,
                entry.hostname.clone(),
                entry.data_dir.clone(),
            ),
            None => {
                let hostname =
                    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
                SegmentHost::new(COORDINATOR_CONTENT_ID, hostname, PathBuf::from("."))
            }
        }
    }

    pub fn segment_hosts(&self) -> Vec<SegmentHost> {
        let mut hosts: Vec<SegmentHost> =
            self.segments.iter().cloned().map(SegmentHost::from).collect();
        hosts.sort_by_key(|h| h.content_id);
        hosts
    }
}
