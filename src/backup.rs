//! The backup run: lock, resolve, stream, finalize, clean up.
//!
//! [`Backup::run`] is fail-fast. [`Backup::cleanup`] always runs afterwards
//! (and on interrupt) and never turns a success into a failure.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{MetadataCatalog, ObjectFilter, Relation};
use crate::cluster::{shell_quote, ClusterExecutor, Scope};
use crate::context::RunContext;
use crate::dependencies::{resolve_dependencies, sort_relations};
use crate::error::{BackupError, Result};
use crate::locks::lock_relations;
use crate::pipes::PipeOrchestrator;
use crate::session::{CatalogSession, SessionInterrupt};

/// Tells every segment to write its share of the relation data into its pipe.
///
/// Called only after all locks are held and every reader is running. Must
/// return once each segment's producer has closed its end of the pipe.
pub trait DataUnloader: Send + Sync {
    fn unload(
        &self,
        ctx: &RunContext,
        executor: &ClusterExecutor,
        relations: &[Relation],
    ) -> Result<()>;
}

/// Runs a shell command template on every segment.
///
/// Placeholders: `{pipe}`, `{toc}`, `{content}`, `{timestamp}` and `{tables}`
/// (comma separated names of the relations holding segment data). Paths and
/// the table list are substituted as single shell words.
#[derive(Debug, Clone)]
pub struct CommandUnloader {
    template: String,
}

impl CommandUnloader {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn command_for(&self, ctx: &RunContext, content_id: i32, relations: &[Relation]) -> String {
        let tables = relations
            .iter()
            .filter(|r| r.holds_segment_data())
            .map(Relation::fqn)
            .collect::<Vec<_>>()
            .join(",");
        self.template
            .replace(
                "{pipe}",
                &shell_quote(&ctx.segment_pipe_path(content_id).to_string_lossy()),
            )
            .replace(
                "{toc}",
                &shell_quote(&ctx.segment_toc_source_path(content_id).to_string_lossy()),
            )
            .replace("{content}", &content_id.to_string())
            .replace("{timestamp}", &ctx.timestamp)
            .replace("{tables}", &shell_quote(&tables))
    }
}

impl DataUnloader for CommandUnloader {
    fn unload(
        &self,
        ctx: &RunContext,
        executor: &ClusterExecutor,
        relations: &[Relation],
    ) -> Result<()> {
        executor.execute_and_check(
            "Unloading relation data on segments",
            |id| self.command_for(ctx, id, relations),
            Scope::SegmentsOnly,
            "Unable to unload relation data on segments",
            |id| format!("Unload failed for segment {id}"),
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub timestamp: String,
    /// Relations in creation order.
    pub relations: Vec<String>,
    pub locked: usize,
    pub segments: usize,
    pub plan_path: PathBuf,
}

#[derive(Serialize)]
struct Plan<'a> {
    tool: &'a str,
    timestamp: &'a str,
    relations: &'a [Relation],
}

pub struct Backup {
    ctx: RunContext,
    executor: ClusterExecutor,
    session: Mutex<Option<Box<dyn CatalogSession>>>,
    interrupt: Option<Arc<dyn SessionInterrupt>>,
    /// Held by `run` around each dispatch that creates state on the hosts,
    /// and by `cleanup` while it removes that state.
    dispatch: Mutex<()>,
    cleaned_up: AtomicBool,
}

impl Backup {
    pub fn new(
        ctx: RunContext,
        executor: ClusterExecutor,
        session: Box<dyn CatalogSession>,
    ) -> Self {
        Self {
            ctx,
            executor,
            interrupt: session.interrupter(),
            session: Mutex::new(Some(session)),
            dispatch: Mutex::new(()),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn session(&self) -> MutexGuard<'_, Option<Box<dyn CatalogSession>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.cleaned_up.load(Ordering::SeqCst) {
            return Err(BackupError::Interrupted);
        }
        Ok(())
    }

    /// Start a state-creating dispatch, unless cleanup has begun.
    fn begin_dispatch(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        self.check_interrupted()?;
        Ok(guard)
    }

    /// End the session from under a statement `run` is blocked on.
    fn interrupt_pending_statement(&self) {
        if !matches!(self.session.try_lock(), Err(TryLockError::WouldBlock)) {
            return;
        }
        let Some(interrupt) = &self.interrupt else {
            warn!("Catalog session is busy and cannot be interrupted, waiting for it");
            return;
        };
        info!("Interrupting the catalog session");
        if let Err(e) = interrupt.interrupt() {
            warn!("Unable to interrupt catalog session: {}", e);
        }
    }

    /// Run the main protocol. Does not clean up; see [`Backup::execute`].
    pub fn run(
        &self,
        catalog: &dyn MetadataCatalog,
        unloader: &dyn DataUnloader,
        filter: &ObjectFilter,
    ) -> Result<BackupSummary> {
        info!("Starting backup {}", self.ctx.timestamp);
        let pipes = PipeOrchestrator::new(&self.ctx, &self.executor);
        pipes.validate_plugin()?;

        // Extension-owned objects are neither locked nor captured.
        let external = catalog.fetch_external_object_identities()?;
        let relations: Vec<Relation> = catalog
            .fetch_relations(filter)?
            .into_iter()
            .filter(|r| !external.contains(&r.oid))
            .collect();
        info!("Gathered {} relations", relations.len());

        let locked = {
            let mut guard = self.session();
            // Checked under the guard so cleanup either sees the statement
            // in flight or this run sees cleanup.
            self.check_interrupted()?;
            let session = guard
                .as_mut()
                .ok_or_else(|| BackupError::Session("catalog session is closed".to_string()))?;
            lock_relations(&mut **session, &relations)?
        };
        self.check_interrupted()?;

        let edges = catalog.fetch_dependency_edges(filter)?;
        let owners = catalog.fetch_sequence_owners()?;
        let resolved =
            resolve_dependencies(relations, &edges, &external, &owners, filter.is_active());
        let ordered = sort_relations(resolved)?;

        let plan_path = {
            let _dispatch = self.begin_dispatch()?;
            pipes.create_backup_directories()?;
            self.write_plan(&ordered)?
        };
        {
            let _dispatch = self.begin_dispatch()?;
            pipes.create_segment_pipes()?;
        }
        {
            let _dispatch = self.begin_dispatch()?;
            pipes.read_from_segment_pipes()?;
        }
        self.check_interrupted()?;

        unloader.unload(&self.ctx, &self.executor, &ordered)?;
        self.check_interrupted()?;

        pipes.verify_segment_readers()?;
        self.check_interrupted()?;
        pipes.move_segment_tocs_and_make_read_only()?;
        info!("Backup {} complete", self.ctx.timestamp);

        Ok(BackupSummary {
            timestamp: self.ctx.timestamp.clone(),
            relations: ordered.iter().map(Relation::fqn).collect(),
            locked,
            segments: self.ctx.segments.len(),
            plan_path,
        })
    }

    fn write_plan(&self, relations: &[Relation]) -> Result<PathBuf> {
        let path = self.ctx.plan_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let plan = Plan {
            tool: &self.ctx.tool,
            timestamp: &self.ctx.timestamp,
            relations,
        };
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &plan)
            .map_err(|e| BackupError::Io(e.into()))?;
        debug!("Wrote object plan to {}", path.display());
        Ok(path)
    }

    /// Stop readers, remove pipes, drop partial tables of contents after a
    /// failure, and end the session. Only the first call does anything.
    ///
    /// Safe to call from another thread while `run` is in progress: a
    /// statement it is blocked on is interrupted, and a dispatch it has in
    /// flight finishes before readers and pipes are removed.
    pub fn cleanup(&self, succeeded: bool) -> Vec<BackupError> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.interrupt_pending_statement();

        let pipes = PipeOrchestrator::new(&self.ctx, &self.executor);
        let mut failures = {
            let _dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            pipes.cleanup()
        };

        if !succeeded {
            if let Err(e) = pipes.cleanup_segment_tocs() {
                warn!("{}", e);
                failures.push(BackupError::Cleanup(e.to_string()));
            }
        }

        if let Some(mut session) = self.session().take().filter(|s| s.is_open()) {
            if let Err(e) = session.close() {
                warn!("Unable to close catalog session: {}", e);
                failures.push(BackupError::Cleanup(e.to_string()));
            }
        }
        failures
    }

    /// [`Backup::run`] followed by [`Backup::cleanup`].
    pub fn execute(
        &self,
        catalog: &dyn MetadataCatalog,
        unloader: &dyn DataUnloader,
        filter: &ObjectFilter,
    ) -> Result<BackupSummary> {
        let result = self.run(catalog, unloader, filter);
        let failures = self.cleanup(result.is_ok());
        if !failures.is_empty() {
            warn!("{} cleanup step(s) failed", failures.len());
        }
        result
    }
}
