//! Per-run context: timestamp, topology, and every per-content path.
//!
//! A [`RunContext`] is built once per invocation and passed to each
//! component, so nothing about the run lives in global state.
//!
//! Layout for content `C` and run timestamp `T` (tool name `segbackup`):
//!
//! ```text
//! <root>/<T>/segbackup_C_T_pipe        transient named pipe (segments)
//! <root>/<T>/segbackup_C_T[.gz]        data file or plugin destination
//! <root>/<T>/segbackup_C_T_reader.err  reader exit status, empty on success
//! <root>/<T>/segbackup_C_T_reader.log  stderr of every reader stage
//! <root>/<T>/segbackup_C_T_toc.yaml    table of contents (read-only)
//! <data_dir>/segbackup_C_T_toc.yaml    table of contents before finalize
//! ```
//!
//! `<root>` is `<backup_dir>/gpseg<C>` when a backup directory is configured
//! and `<data_dir>/backups` otherwise.

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::cluster::SegmentHost;
use crate::config::{Compression, PluginConfig};

#[derive(Debug, Clone)]
pub struct RunContext {
    pub tool: String,
    pub timestamp: String,
    pub backup_dir: Option<PathBuf>,
    pub coordinator: SegmentHost,
    pub segments: Vec<SegmentHost>,
    pub compression: Option<Compression>,
    pub plugin: Option<PluginConfig>,
    /// Bound on waiting for readers to drain. `None` waits for them to exit.
    pub reader_timeout_secs: Option<u64>,
}

/// A fresh run timestamp, `YYYYMMDDHHMMSS` in local time.
pub fn new_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

impl RunContext {
    pub fn new(
        tool: impl Into<String>,
        timestamp: impl Into<String>,
        coordinator: SegmentHost,
        segments: Vec<SegmentHost>,
    ) -> Self {
        Self {
            tool: tool.into(),
            timestamp: timestamp.into(),
            backup_dir: None,
            coordinator,
            segments,
            compression: None,
            plugin: None,
            reader_timeout_secs: None,
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_plugin(mut self, plugin: Option<PluginConfig>) -> Self {
        self.plugin = plugin;
        self
    }

    pub fn host(&self, content_id: i32) -> Option<&SegmentHost> {
        if content_id < 0 {
            Some(&self.coordinator)
        } else {
            self.segments.iter().find(|s| s.content_id == content_id)
        }
    }

    fn content_root(&self, content_id: i32) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.join(format!("gpseg{content_id}")),
            None => self
                .host(content_id)
                .map(|h| h.data_dir.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }

    /// The per-run working directory for one content.
    pub fn dir_for_content(&self, content_id: i32) -> PathBuf {
        self.content_root(content_id).join(&self.timestamp)
    }

    /// `<tool>_<content-id>_<timestamp>`: names every artifact of this
    /// (host, run) pair and finds its orphaned reader processes.
    pub fn process_pattern(&self, content_id: i32) -> String {
        format!("{}_{}_{}", self.tool, content_id, self.timestamp)
    }

    pub fn segment_pipe_path(&self, content_id: i32) -> PathBuf {
        self.dir_for_content(content_id)
            .join(format!("{}_pipe", self.process_pattern(content_id)))
    }

    /// Destination of the reader: a local file, or the path handed to the plugin.
    pub fn table_backup_file_path(&self, content_id: i32) -> PathBuf {
        let mut name = self.process_pattern(content_id);
        if let Some(compression) = &self.compression {
            name.push_str(&compression.extension);
        }
        self.dir_for_content(content_id).join(name)
    }

    /// Written only when a reader stage exits nonzero.
    pub fn reader_error_log_path(&self, content_id: i32) -> PathBuf {
        self.dir_for_content(content_id)
            .join(format!("{}_reader.err", self.process_pattern(content_id)))
    }

    /// Diagnostics the reader stages print; never a failure by itself.
    pub fn reader_log_path(&self, content_id: i32) -> PathBuf {
        self.dir_for_content(content_id)
            .join(format!("{}_reader.log", self.process_pattern(content_id)))
    }

    fn toc_file_name(&self, content_id: i32) -> String {
        format!("{}_toc.yaml", self.process_pattern(content_id))
    }

    /// Where the segment writes its table of contents during the unload.
    pub fn segment_toc_source_path(&self, content_id: i32) -> PathBuf {
        let data_dir = self
            .host(content_id)
            .map(|h| h.data_dir.as_path())
            .unwrap_or_else(|| Path::new("."));
        data_dir.join(self.toc_file_name(content_id))
    }

    /// Final, read-only location of the segment table of contents.
    pub fn segment_toc_path(&self, content_id: i32) -> PathBuf {
        self.dir_for_content(content_id)
            .join(self.toc_file_name(content_id))
    }

    /// Ordered object plan written on the coordinator.
    pub fn plan_file_path(&self) -> PathBuf {
        self.dir_for_content(self.coordinator.content_id)
            .join(format!("{}_{}_plan.json", self.tool, self.timestamp))
    }
}
