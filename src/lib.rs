//! Segbackup library - coordinated backups of a segmented database cluster.
//!
//! A run takes ACCESS SHARE locks on every in-scope relation from a single
//! coordinator session, orders the relations by their dependencies, and then
//! has every segment stream its data through a named pipe into a local file
//! or a storage plugin.
//!
//! # Modules
//!
//! - [`backup`] - Top-level run: lock, resolve, stream, finalize, cleanup
//! - [`catalog`] - Relation model and the read-only metadata catalog
//! - [`cluster`] - Concurrent command dispatch to coordinator and segments
//! - [`dependencies`] - Dependency resolution and ordering
//! - [`locks`] - Relation locking
//! - [`pipes`] - Per-segment named pipes and their readers
//!
//! # Example
//!
//! ```no_run
//! use segbackup::{Backup, ClusterExecutor, CommandUnloader, ObjectFilter, PsqlSession};
//! use segbackup::{ConnectionConfig, RunContext, SegmentHost, SnapshotCatalog, Transport};
//! use std::path::Path;
//!
//! let coordinator = SegmentHost::new(-1, "mdw", "/data/coordinator");
//! let segments = vec![SegmentHost::new(0, "sdw1", "/data/primary/gpseg0")];
//! let ctx = RunContext::new("segbackup", "20260101000000", coordinator.clone(), segments.clone());
//! let executor = ClusterExecutor::new(coordinator, segments, Transport::Ssh);
//! let session = PsqlSession::connect(&ConnectionConfig {
//!     dbname: "postgres".to_string(),
//!     ..ConnectionConfig::default()
//! })
//! .expect("Failed to connect");
//!
//! let catalog = SnapshotCatalog::load(Path::new("catalog.json")).expect("Failed to load catalog");
//! let backup = Backup::new(ctx, executor, Box::new(session));
//! let unloader = CommandUnloader::new("unload_segment --tables {tables} > {pipe}");
//! backup
//!     .execute(&catalog, &unloader, &ObjectFilter::default())
//!     .expect("Backup failed");
//! ```

pub mod backup;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod context;
pub mod dependencies;
pub mod error;
pub mod locks;
pub mod pipes;
pub mod session;

pub use backup::{Backup, BackupSummary, CommandUnloader, DataUnloader};
pub use catalog::{MetadataCatalog, ObjectFilter, Relation, SnapshotCatalog};
pub use cluster::{ClusterExecutor, RemoteOutput, Scope, SegmentHost, Transport};
pub use config::{ClusterConfig, Compression, Config, ConnectionConfig, PluginConfig};
pub use context::RunContext;
pub use error::{BackupError, HostFailure, Result};
pub use pipes::PipeOrchestrator;
pub use session::{CatalogSession, PsqlSession, SessionInterrupt};
