//! Common test utilities for segbackup integration tests.
//!
//! Tests run against a "cluster" of localhost segments: every host is this
//! machine, commands go through the local transport, and all data and backup
//! directories live in one `TempDir`.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use segbackup::{
    BackupError, CatalogSession, ClusterExecutor, PluginConfig, Result, RunContext, SegmentHost,
    SessionInterrupt, Transport,
};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tempfile::TempDir;

static NEXT_RUN: AtomicU32 = AtomicU32::new(0);

/// A run timestamp no other test in this process uses, so reader process
/// patterns never collide between tests running in parallel.
pub fn unique_timestamp() -> String {
    format!(
        "2026{:06}{:04}",
        process::id() % 1_000_000,
        NEXT_RUN.fetch_add(1, Ordering::SeqCst) % 10_000
    )
}

pub struct LocalCluster {
    pub dir: TempDir,
    pub ctx: RunContext,
}

impl LocalCluster {
    pub fn new(segments: i32) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let coordinator = SegmentHost::new(-1, "localhost", dir.path().join("coordinator"));
        let segments: Vec<SegmentHost> = (0..segments)
            .map(|i| SegmentHost::new(i, "localhost", dir.path().join(format!("seg{i}"))))
            .collect();
        for host in std::iter::once(&coordinator).chain(segments.iter()) {
            fs::create_dir_all(&host.data_dir).expect("Failed to create data dir");
        }
        let mut ctx = RunContext::new("segbackup", unique_timestamp(), coordinator, segments)
            .with_backup_dir(dir.path().join("backups"));
        // Keeps a broken reader from hanging the test run.
        ctx.reader_timeout_secs = Some(30);
        Self { dir, ctx }
    }

    pub fn executor(&self) -> ClusterExecutor {
        ClusterExecutor::new(
            self.ctx.coordinator.clone(),
            self.ctx.segments.clone(),
            Transport::Local,
        )
    }
}

/// Install a shell-script storage plugin and return its loaded config.
///
/// `body` runs with the plugin arguments; `$3` is the destination path.
pub fn install_plugin(dir: &Path, body: &str) -> PluginConfig {
    let script = dir.join("plugin.sh");
    fs::write(
        &script,
        format!("#!/bin/sh\n[ \"$1\" = backup_data ] || exit 2\n{body}\n"),
    )
    .expect("Failed to write plugin");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
        .expect("Failed to make plugin executable");

    let config = dir.join("plugin.yaml");
    fs::write(
        &config,
        format!(
            "executablepath: {}\noptions:\n  bucket: test\n",
            script.display()
        ),
    )
    .expect("Failed to write plugin config");
    PluginConfig::load(&config).expect("Failed to load plugin config")
}

/// A plugin that stores its input at the destination path.
pub fn copying_plugin(dir: &Path) -> PluginConfig {
    install_plugin(dir, "cat > \"$3\"")
}

/// Pids of every live process whose command line mentions `pattern`.
pub fn processes_matching(pattern: &str) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    sys.processes()
        .iter()
        .filter(|(_, p)| {
            p.cmd()
                .iter()
                .any(|arg| arg.to_string_lossy().contains(pattern))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

/// Write `data` into a named pipe and close it, as a segment producer would.
pub fn produce(pipe: &Path, data: &[u8]) {
    fs::write(pipe, data).expect("Failed to write into segment pipe");
}

/// Decompressed content of a gzip file.
pub fn gunzip(path: &Path) -> Vec<u8> {
    let output = process::Command::new("gzip")
        .arg("-dc")
        .arg(path)
        .output()
        .expect("Failed to run gzip");
    assert!(output.status.success(), "gzip -dc {} failed", path.display());
    output.stdout
}

/// A catalog session that records statements instead of talking to a server.
#[derive(Clone, Default)]
pub struct FakeSession {
    pub log: Arc<Mutex<Vec<String>>>,
    pub fail_on: Option<String>,
    open: bool,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            open: true,
            ..Self::default()
        }
    }

    /// Fail any statement mentioning `needle`.
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::new()
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl CatalogSession for FakeSession {
    fn execute(&mut self, statement: &str) -> Result<()> {
        if !self.open {
            return Err(BackupError::Session("session is closed".to_string()));
        }
        if let Some(needle) = &self.fail_on {
            if statement.contains(needle.as_str()) {
                return Err(BackupError::Session("lock not available".to_string()));
            }
        }
        self.log.lock().unwrap().push(statement.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.log.lock().unwrap().push("CLOSE".to_string());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Default)]
struct StallState {
    waiting: bool,
    interrupted: bool,
    closed: bool,
}

/// A session whose every statement hangs, like a LOCK TABLE queued behind a
/// conflicting lock, until the session is interrupted.
#[derive(Clone, Default)]
pub struct StallingSession {
    state: Arc<(Mutex<StallState>, Condvar)>,
}

impl StallingSession {
    fn state(&self) -> std::sync::MutexGuard<'_, StallState> {
        self.state.0.lock().unwrap()
    }

    pub fn is_waiting(&self) -> bool {
        self.state().waiting
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl CatalogSession for StallingSession {
    fn execute(&mut self, _statement: &str) -> Result<()> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.waiting = true;
        let (mut state, _) = cvar
            .wait_timeout_while(state, Duration::from_secs(30), |s| !s.interrupted)
            .unwrap();
        state.waiting = false;
        if state.interrupted {
            return Err(BackupError::Session("session terminated".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.state();
        !state.closed && !state.interrupted
    }

    fn interrupter(&self) -> Option<Arc<dyn SessionInterrupt>> {
        Some(Arc::new(self.clone()))
    }
}

impl SessionInterrupt for StallingSession {
    fn interrupt(&self) -> Result<()> {
        self.state().interrupted = true;
        self.state.1.notify_all();
        Ok(())
    }
}

pub fn mode(path: &Path) -> u32 {
    fs::metadata(path)
        .expect("Failed to stat file")
        .permissions()
        .mode()
        & 0o777
}
