//! Per-segment data pipes.
//!
//! Each segment gets a run-scoped named pipe and a detached background reader
//! that copies whatever the producer writes into the pipe to either a local
//! file or a storage plugin, optionally through a compression filter. The
//! dispatch that starts the readers returns immediately; a reader finishes on
//! its own once the producer closes its end of the pipe.
//!
//! No handle to a reader is kept. Finding and stopping readers relies on the
//! `<tool>_<content-id>_<timestamp>` pattern appearing in their command
//! lines, which a scan of `/proc` matches.

use std::path::Path;

use tracing::{info, warn};

use crate::cluster::{shell_quote, ClusterExecutor, Scope};
use crate::context::RunContext;
use crate::error::{BackupError, Result};

fn q(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Shell snippet running `action` for every process whose command line
/// contains `pattern`. The scanning shell and other scans are never matched.
fn for_each_matching_process(pattern: &str, action: &str) -> String {
    format!(
        "for p in /proc/[0-9]*; do pid=${{p#/proc/}}; [ \"$pid\" = \"$$\" ] && continue; \
         if grep -qsF -- {pat} \"$p/cmdline\" && ! grep -qsF -- '/proc/[0-9]' \"$p/cmdline\"; then \
         {action}; fi; done",
        pat = shell_quote(pattern),
    )
}

/// The background reader for one segment.
///
/// The stream is `cat <pipe>`, then the compression filter if any, then
/// either `> <file>` or the plugin's `backup_data` command. Whatever the
/// stages print on stderr goes to the reader log. Only a nonzero exit is
/// recorded in the reader error log. A reader that sees zero bytes before
/// the producer closes the pipe exits cleanly and counts as success.
pub fn reader_command(ctx: &RunContext, content_id: i32) -> String {
    let pipe = q(&ctx.segment_pipe_path(content_id));
    let destination = q(&ctx.table_backup_file_path(content_id));
    let error_log = q(&ctx.reader_error_log_path(content_id));
    let reader_log = q(&ctx.reader_log_path(content_id));

    let mut stream = format!("cat {pipe}");
    if let Some(compression) = &ctx.compression {
        stream.push_str(" | ");
        stream.push_str(&compression.compress_command);
    }
    match &ctx.plugin {
        Some(plugin) => stream.push_str(&format!(
            " | {} backup_data {} {destination}",
            q(&plugin.executable_path),
            q(&plugin.config_path),
        )),
        None => stream.push_str(&format!(" > {destination}")),
    }

    format!(
        "[ -p {pipe} ] || {{ echo \"segment pipe {pipe} does not exist\" >&2; exit 1; }}; \
         ( trap '' HUP; set -o pipefail; \
         {stream} || echo \"reader exited with status $?\" >> {error_log} ) \
         < /dev/null > /dev/null 2>> {reader_log} &"
    )
}

/// Kill every reader left behind for this (host, run). No match is success.
pub fn kill_readers_command(pattern: &str) -> String {
    format!(
        "{}; exit 0",
        for_each_matching_process(pattern, "kill -9 \"$pid\" 2>/dev/null")
    )
}

/// Wait for the readers to drain and exit, then fail if any reader stage
/// exited nonzero. With `timeout_secs` set, a reader still running after
/// that long is a failure too. The reader log is echoed with a failure.
pub fn wait_for_readers_command(
    pattern: &str,
    error_log: &Path,
    reader_log: &Path,
    timeout_secs: Option<u64>,
) -> String {
    let scan = for_each_matching_process(pattern, "found=1; break");
    let poll = format!("found=0; {scan}; [ \"$found\" = 0 ] && break; sleep 0.1");
    let error_log = q(error_log);
    let mut cmd = match timeout_secs {
        Some(secs) => format!(
            "for ((i = 0; i < {}; i++)); do {poll}; done; ",
            secs.max(1) * 10
        ),
        None => format!("while :; do {poll}; done; "),
    };
    cmd.push_str(&format!(
        "if [ -s {error_log} ]; then cat {error_log} >&2; cat {} >&2 2>/dev/null; exit 1; fi",
        q(reader_log)
    ));
    if let Some(secs) = timeout_secs {
        cmd.push_str(&format!(
            "; if [ \"$found\" = 1 ]; then echo \"reader still running after {secs}s\" >&2; exit 1; fi"
        ));
    }
    cmd
}

pub struct PipeOrchestrator<'a> {
    ctx: &'a RunContext,
    executor: &'a ClusterExecutor,
}

impl<'a> PipeOrchestrator<'a> {
    pub fn new(ctx: &'a RunContext, executor: &'a ClusterExecutor) -> Self {
        Self { ctx, executor }
    }

    /// Check the storage plugin is runnable everywhere before any state is
    /// created. A no-op without a plugin.
    pub fn validate_plugin(&self) -> Result<()> {
        let Some(plugin) = &self.ctx.plugin else {
            return Ok(());
        };
        let executable = q(&plugin.executable_path);
        self.executor.execute_and_check(
            "Validating storage plugin",
            |_| format!("[ -x {executable} ]"),
            Scope::CoordinatorAndSegments,
            "Storage plugin is not available on every host",
            |_| {
                format!(
                    "Plugin {} is missing or not executable",
                    plugin.executable_path.display()
                )
            },
        )?;
        Ok(())
    }

    /// `mkdir -p` on the coordinator and every segment. Existing is fine.
    pub fn create_backup_directories(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Creating backup directories",
            |id| format!("mkdir -p {}", q(&ctx.dir_for_content(id))),
            Scope::CoordinatorAndSegments,
            "Unable to create backup directories",
            |id| {
                format!(
                    "Unable to create backup directory {}",
                    ctx.dir_for_content(id).display()
                )
            },
        )?;
        Ok(())
    }

    /// Create each segment's pipe. A pipe left from the same run is fatal.
    pub fn create_segment_pipes(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Creating segment data pipes",
            |id| format!("mkfifo {}", q(&ctx.segment_pipe_path(id))),
            Scope::SegmentsOnly,
            "Unable to create segment data pipes",
            |id| {
                format!(
                    "Unable to create segment data pipe {}",
                    ctx.segment_pipe_path(id).display()
                )
            },
        )?;
        Ok(())
    }

    /// Start the detached readers; returns as soon as each is launched.
    pub fn read_from_segment_pipes(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Reading from segment data pipes",
            |id| reader_command(ctx, id),
            Scope::SegmentsOnly,
            "Unable to read from segment data pipes",
            |_| "Unable to read from segment data pipe".to_string(),
        )?;
        Ok(())
    }

    /// Block until every reader has drained, surfacing reader failures.
    pub fn verify_segment_readers(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Waiting for segment readers to finish",
            |id| {
                wait_for_readers_command(
                    &ctx.process_pattern(id),
                    &ctx.reader_error_log_path(id),
                    &ctx.reader_log_path(id),
                    ctx.reader_timeout_secs,
                )
            },
            Scope::SegmentsOnly,
            "Segment data readers did not complete",
            |id| {
                format!(
                    "Reader for segment data pipe {} failed",
                    ctx.segment_pipe_path(id).display()
                )
            },
        )?;
        Ok(())
    }

    /// Make each segment's table of contents read-only and move it into the
    /// run directory, replacing any stale file of the same name.
    pub fn move_segment_tocs_and_make_read_only(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Setting permissions on segment table of contents files and moving to backup directories",
            |id| {
                let toc = q(&ctx.segment_toc_source_path(id));
                format!(
                    "chmod 444 {toc} && mv -f {toc} {}",
                    q(&ctx.segment_toc_path(id))
                )
            },
            Scope::SegmentsOnly,
            "Unable to set permissions on or move segment table of contents files",
            |id| {
                format!(
                    "Unable to set permissions on or move file {}",
                    ctx.segment_toc_source_path(id).display()
                )
            },
        )?;
        Ok(())
    }

    pub fn cleanup_segment_readers(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Cleaning up segment reader processes",
            |id| kill_readers_command(&ctx.process_pattern(id)),
            Scope::SegmentsOnly,
            "Unable to clean up reader processes",
            |_| "Unable to clean up reader process".to_string(),
        )?;
        Ok(())
    }

    pub fn cleanup_segment_pipes(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Cleaning up segment data pipes",
            |id| format!("rm -f {}", q(&ctx.segment_pipe_path(id))),
            Scope::SegmentsOnly,
            "Unable to clean up segment data pipes",
            |_| "Unable to clean up segment data pipe".to_string(),
        )?;
        Ok(())
    }

    /// Remove table of contents files a failed run left in the data directories.
    pub fn cleanup_segment_tocs(&self) -> Result<()> {
        let ctx = self.ctx;
        self.executor.execute_and_check(
            "Cleaning up segment table of contents files",
            |id| format!("rm -f {}", q(&ctx.segment_toc_source_path(id))),
            Scope::SegmentsOnly,
            "Unable to remove segment table of contents files",
            |id| {
                format!(
                    "Unable to remove segment table of contents file {}",
                    ctx.segment_toc_source_path(id).display()
                )
            },
        )?;
        Ok(())
    }

    /// Stop readers, then remove pipes. Safe to call when nothing was ever
    /// created and safe to call repeatedly. Failures are logged and returned
    /// but never abort the caller.
    pub fn cleanup(&self) -> Vec<BackupError> {
        info!("Cleaning up segment pipes and readers");
        let mut failures = Vec::new();
        let steps: [fn(&Self) -> Result<()>; 2] =
            [Self::cleanup_segment_readers, Self::cleanup_segment_pipes];
        for step in steps {
            if let Err(e) = step(self) {
                warn!("{}", e);
                failures.push(BackupError::Cleanup(e.to_string()));
            }
        }
        failures
    }
}
