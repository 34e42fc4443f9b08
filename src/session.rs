//! The single SQL session a backup run owns on the coordinator.
//!
//! Relation locks are taken inside this session's transaction and are released
//! only when the session ends, so the session must live for the whole capture.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{BackupError, Result};

pub trait CatalogSession: Send {
    /// Run one statement and wait for it to complete.
    fn execute(&mut self, statement: &str) -> Result<()>;

    /// End the session, releasing every lock it holds. Idempotent.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// A handle that ends the session from another thread while `execute`
    /// is blocked, if the session supports it.
    fn interrupter(&self) -> Option<Arc<dyn SessionInterrupt>> {
        None
    }
}

/// Ends a session without waiting for its in-flight statement. The blocked
/// `execute` then returns an error.
pub trait SessionInterrupt: Send + Sync {
    fn interrupt(&self) -> Result<()>;
}

type SharedChild = Arc<Mutex<Option<Child>>>;

fn lock_child(child: &SharedChild) -> std::sync::MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

/// A session held open over a `psql` child process.
///
/// Each statement is followed by an `\echo` marker; reading the marker back
/// means the statement finished. `ON_ERROR_STOP` makes psql exit on the first
/// error, which shows up here as end-of-output before the marker.
pub struct PsqlSession {
    child: SharedChild,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    statements: u64,
}

impl PsqlSession {
    /// Connect and open the transaction locks will be held in.
    pub fn connect(conn: &ConnectionConfig) -> Result<Self> {
        let mut cmd = Command::new("psql");
        cmd.args(["-X", "-q", "-A", "-t", "-v", "ON_ERROR_STOP=1"]);
        if let Some(host) = &conn.host {
            cmd.args(["-h", host]);
        }
        if let Some(port) = conn.port {
            cmd.args(["-p", &port.to_string()]);
        }
        if let Some(user) = &conn.user {
            cmd.args(["-U", user]);
        }
        cmd.arg(&conn.dbname)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| BackupError::Session(format!("failed to start psql: {e}")))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let mut session = Self {
            child: Arc::new(Mutex::new(Some(child))),
            stdin,
            stdout,
            statements: 0,
        };
        session.execute("BEGIN")?;
        session.execute("SET application_name = 'segbackup'")?;
        Ok(session)
    }

    fn marker(&self) -> String {
        format!("__segbackup_done_{}", self.statements)
    }
}

impl CatalogSession for PsqlSession {
    fn execute(&mut self, statement: &str) -> Result<()> {
        self.statements += 1;
        let marker = self.marker();
        let (Some(stdin), Some(stdout)) = (self.stdin.as_mut(), self.stdout.as_mut()) else {
            return Err(BackupError::Session("session is closed".to_string()));
        };
        debug!("session: {}", statement);
        let statement = statement.trim_end().trim_end_matches(';');
        writeln!(stdin, "{statement};\n\\echo {marker}")
            .and_then(|_| stdin.flush())
            .map_err(|e| BackupError::Session(format!("lost connection to psql: {e}")))?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout
                .read_line(&mut line)
                .map_err(|e| BackupError::Session(format!("lost connection to psql: {e}")))?;
            if read == 0 {
                return Err(BackupError::Session(format!(
                    "psql exited while running: {statement}"
                )));
            }
            if line.trim_end() == marker {
                return Ok(());
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        // Closing stdin ends psql, which ends the transaction and its locks.
        self.stdin.take();
        self.stdout.take();
        let child = lock_child(&self.child).take();
        if let Some(mut child) = child {
            match child.wait() {
                Ok(status) if !status.success() => {
                    debug!("psql session ended with {}", status);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("failed to wait for psql session: {}", e);
                    return Err(BackupError::Session(format!(
                        "failed to wait for psql: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock_child(&self.child).is_some()
    }

    fn interrupter(&self) -> Option<Arc<dyn SessionInterrupt>> {
        Some(Arc::new(PsqlInterrupt {
            child: Arc::clone(&self.child),
        }))
    }
}

/// Kills the psql child. The server rolls back the transaction and drops its
/// locks, including any lock request still queued.
struct PsqlInterrupt {
    child: SharedChild,
}

impl SessionInterrupt for PsqlInterrupt {
    fn interrupt(&self) -> Result<()> {
        if let Some(child) = lock_child(&self.child).as_mut() {
            child
                .kill()
                .map_err(|e| BackupError::Session(format!("failed to stop psql: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for PsqlSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
