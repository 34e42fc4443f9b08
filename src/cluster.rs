//! Cross-cluster command dispatch.
//!
//! A logical operation is turned into one shell command per host (via a
//! content-id -> command builder) and executed on every host in scope
//! concurrently, one worker thread per host. Dispatch blocks until every host
//! has answered; [`ClusterExecutor::check_cluster_error`] then turns any
//! failures into a single composite error.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::channel;

use tracing::{debug, error, info};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::error::{BackupError, HostFailure, Result};

/// Content id of the coordinator.
pub const COORDINATOR_CONTENT_ID: i32 = -1;

/// Which hosts a dispatch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    CoordinatorOnly,
    SegmentsOnly,
    CoordinatorAndSegments,
}

impl Scope {
    fn includes(self, content_id: i32) -> bool {
        match self {
            Scope::CoordinatorOnly => content_id < 0,
            Scope::SegmentsOnly => content_id >= 0,
            Scope::CoordinatorAndSegments => true,
        }
    }
}

/// How commands reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Run through `bash -c` on this machine, whatever the hostname says.
    Local,
    /// Run through `ssh <hostname> bash -c ...`.
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHost {
    /// Negative for the coordinator, non-negative for segments.
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
}

impl SegmentHost {
    pub fn new(content_id: i32, hostname: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_id,
            hostname: hostname.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.content_id < 0
    }
}

/// Result of running one command on one host.
#[derive(Debug, Clone)]
pub struct HostOutput {
    pub content_id: i32,
    pub hostname: String,
    pub command: String,
    /// `None` if the command could not be started or was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutput {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// Aggregated outputs of one dispatch, ordered by content id.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub scope: Scope,
    pub outputs: Vec<HostOutput>,
}

impl RemoteOutput {
    pub fn num_errors(&self) -> usize {
        self.outputs.iter().filter(|o| !o.succeeded()).count()
    }

    pub fn failed_content_ids(&self) -> Vec<i32> {
        self.outputs
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.content_id)
            .collect()
    }

    pub fn output_for(&self, content_id: i32) -> Option<&HostOutput> {
        self.outputs.iter().find(|o| o.content_id == content_id)
    }
}

pub struct ClusterExecutor {
    coordinator: SegmentHost,
    segments: Vec<SegmentHost>,
    transport: Transport,
}

impl ClusterExecutor {
    pub fn new(coordinator: SegmentHost, segments: Vec<SegmentHost>, transport: Transport) -> Self {
        Self {
            coordinator,
            segments,
            transport,
        }
    }

    pub fn coordinator(&self) -> &SegmentHost {
        &self.coordinator
    }

    pub fn segments(&self) -> &[SegmentHost] {
        &self.segments
    }

    pub fn host(&self, content_id: i32) -> Option<&SegmentHost> {
        if content_id < 0 {
            Some(&self.coordinator)
        } else {
            self.segments.iter().find(|s| s.content_id == content_id)
        }
    }

    fn hosts_in_scope(&self, scope: Scope) -> Vec<&SegmentHost> {
        std::iter::once(&self.coordinator)
            .chain(self.segments.iter())
            .filter(|h| scope.includes(h.content_id))
            .collect()
    }

    /// Build one command per host in `scope` and run them all concurrently.
    ///
    /// Every host gets exactly one execution; there are no retries. Returns
    /// once every host has completed or failed.
    pub fn generate_and_execute_command<F>(
        &self,
        description: &str,
        command_builder: F,
        scope: Scope,
    ) -> RemoteOutput
    where
        F: Fn(i32) -> String,
    {
        info!("{}", description);
        let hosts = self.hosts_in_scope(scope);
        if hosts.is_empty() {
            return RemoteOutput {
                scope,
                outputs: Vec::new(),
            };
        }

        let pool = Pool::<ThunkWorker<HostOutput>>::new(hosts.len());
        let (tx, rx) = channel();
        for host in &hosts {
            let command = command_builder(host.content_id);
            debug!(
                "content {} on {}: {}",
                host.content_id, host.hostname, command
            );
            let host = (*host).clone();
            let transport = self.transport;
            pool.execute_to(
                tx.clone(),
                Thunk::of(move || run_on_host(transport, &host, command)),
            );
        }
        drop(tx);

        let mut outputs: Vec<HostOutput> = rx.iter().take(hosts.len()).collect();
        pool.join();
        outputs.sort_by_key(|o| o.content_id);
        RemoteOutput { scope, outputs }
    }

    /// Fail with one composite error naming every host that failed.
    ///
    /// Hosts that succeeded are left as they are.
    pub fn check_cluster_error<F>(
        &self,
        output: &RemoteOutput,
        general_message: &str,
        host_message: F,
    ) -> Result<()>
    where
        F: Fn(i32) -> String,
    {
        let failures: Vec<HostFailure> = output
            .outputs
            .iter()
            .filter(|o| !o.succeeded() && output.scope.includes(o.content_id))
            .map(|o| {
                let failure = HostFailure {
                    content_id: o.content_id,
                    hostname: o.hostname.clone(),
                    message: host_message(o.content_id),
                    stderr: o.stderr.trim().to_string(),
                };
                error!("{}", failure);
                debug!("failed command on {}: {}", o.hostname, o.command);
                failure
            })
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        Err(BackupError::ClusterCommand {
            description: general_message.to_string(),
            failures,
        })
    }

    /// Dispatch and check in one call, for callers without extra handling.
    pub fn execute_and_check<F, G>(
        &self,
        description: &str,
        command_builder: F,
        scope: Scope,
        general_message: &str,
        host_message: G,
    ) -> Result<RemoteOutput>
    where
        F: Fn(i32) -> String,
        G: Fn(i32) -> String,
    {
        let output = self.generate_and_execute_command(description, command_builder, scope);
        self.check_cluster_error(&output, general_message, host_message)?;
        Ok(output)
    }
}

fn run_on_host(transport: Transport, host: &SegmentHost, command: String) -> HostOutput {
    let mut cmd = match transport {
        Transport::Local => {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(&command);
            cmd
        }
        Transport::Ssh => {
            let mut cmd = Command::new("ssh");
            cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"])
                .arg(&host.hostname)
                .arg(format!("bash -c {}", shell_quote(&command)));
            cmd
        }
    };
    cmd.stdin(Stdio::null());

    match cmd.output() {
        Ok(out) => HostOutput {
            content_id: host.content_id,
            hostname: host.hostname.clone(),
            command,
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        },
        Err(e) => HostOutput {
            content_id: host.content_id,
            hostname: host.hostname.clone(),
            command,
            status: None,
            stdout: String::new(),
            stderr: format!("failed to start command: {e}"),
        },
    }
}

/// Quote `s` as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
