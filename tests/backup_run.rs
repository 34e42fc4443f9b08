// End-to-end backup runs against a localhost cluster and a catalog snapshot.

mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{
    gunzip, mode, processes_matching, wait_until, FakeSession, LocalCluster, StallingSession,
};
use segbackup::{
    Backup, BackupError, ClusterExecutor, CommandUnloader, Compression, DataUnloader,
    ObjectFilter, Relation, Result, RunContext, SnapshotCatalog,
};

const CATALOG: &str = r#"{
    "relations": [
        {"oid": 10, "schema": "public", "name": "v", "kind": "view"},
        {"oid": 15, "schema": "public", "name": "b_id_seq", "kind": "sequence"},
        {"oid": 20, "schema": "public", "name": "b"},
        {"oid": 30, "schema": "public", "name": "c"},
        {"oid": 40, "schema": "ext", "name": "hstore_tbl"}
    ],
    "edges": [
        {"source": 10, "target_oid": 20, "target": "public.b", "kind": "structural"},
        {"source": 20, "target_oid": 30, "target": "public.c", "kind": "inheritance"}
    ],
    "external_objects": [40],
    "sequence_owners": [
        {"schema": "public", "sequence": "b_id_seq", "table": "b", "column": "id"}
    ]
}"#;

// Each segment streams the table list into its pipe and writes a TOC.
const UNLOAD: &str = "printf '%s' {tables} > {pipe} && echo 'segment: {content}' > {toc}";

fn catalog() -> SnapshotCatalog {
    SnapshotCatalog::from_json(CATALOG).expect("Failed to parse catalog")
}

#[test]
fn test_full_backup() {
    let cluster = LocalCluster::new(2);
    let ctx = cluster
        .ctx
        .clone()
        .with_compression(Some(Compression::gzip(1)));
    let session = FakeSession::new();
    let backup = Backup::new(ctx.clone(), cluster.executor(), Box::new(session.clone()));

    let summary = backup
        .execute(&catalog(), &CommandUnloader::new(UNLOAD), &ObjectFilter::default())
        .expect("backup failed");

    assert_eq!(
        summary.relations,
        vec!["public.b_id_seq", "public.c", "public.b", "public.v"]
    );
    assert_eq!(summary.locked, 3);
    assert_eq!(summary.segments, 2);

    // Locks in identity order, sequences skipped, session ended by cleanup.
    assert_eq!(
        session.statements(),
        vec![
            "LOCK TABLE public.v IN ACCESS SHARE MODE",
            "LOCK TABLE public.b IN ACCESS SHARE MODE",
            "LOCK TABLE public.c IN ACCESS SHARE MODE",
            "CLOSE",
        ]
    );

    let plan: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary.plan_path).unwrap()).unwrap();
    let planned: Vec<&str> = plan["relations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(planned, vec!["b_id_seq", "c", "b", "v"]);
    assert_eq!(plan["relations"][2]["inherits"][0], "public.c");
    assert_eq!(plan["relations"][0]["owned_by"], "public.b.id");

    for id in 0..2 {
        assert_eq!(
            gunzip(&ctx.table_backup_file_path(id)),
            b"public.c,public.b",
            "segment {id} data"
        );
        let toc = ctx.segment_toc_path(id);
        assert_eq!(fs::read_to_string(&toc).unwrap(), format!("segment: {id}\n"));
        assert_eq!(mode(&toc), 0o444);
        assert!(!ctx.segment_pipe_path(id).exists(), "pipe {id} left behind");
    }
}

#[test]
fn test_include_filter_drops_outside_edges() {
    let cluster = LocalCluster::new(1);
    let session = FakeSession::new();
    let backup = Backup::new(cluster.ctx.clone(), cluster.executor(), Box::new(session.clone()));

    let summary = backup
        .execute(
            &catalog(),
            &CommandUnloader::new(UNLOAD),
            &ObjectFilter::include(["public.b"]),
        )
        .expect("backup failed");

    assert_eq!(summary.relations, vec!["public.b"]);
    assert_eq!(
        fs::read(cluster.ctx.table_backup_file_path(0)).unwrap(),
        b"public.b"
    );
}

#[test]
fn test_failed_unload_cleans_up_everything() {
    let cluster = LocalCluster::new(2);
    let ctx = cluster.ctx.clone();
    let session = FakeSession::new();
    let backup = Backup::new(ctx.clone(), cluster.executor(), Box::new(session.clone()));

    // Segment 1 never opens its pipe, leaving its reader blocked.
    let unload = CommandUnloader::new(
        "if [ {content} = 1 ]; then echo 'out of memory' >&2; exit 4; fi; \
         echo 'segment: {content}' > {toc}; printf x > {pipe}",
    );
    let err = backup
        .execute(&catalog(), &unload, &ObjectFilter::default())
        .unwrap_err();
    match &err {
        BackupError::ClusterCommand { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].content_id, 1);
            assert_eq!(failures[0].stderr, "out of memory");
        }
        other => panic!("expected a cluster command error, got {other}"),
    }

    for id in 0..2 {
        let pattern = ctx.process_pattern(id);
        assert!(
            wait_until(Duration::from_secs(5), || processes_matching(&pattern).is_empty()),
            "reader for {pattern} survived cleanup"
        );
        assert!(!ctx.segment_pipe_path(id).exists());
        assert!(
            !ctx.segment_toc_source_path(id).exists(),
            "partial TOC for segment {id} left behind"
        );
    }
    assert_eq!(session.statements().last().map(String::as_str), Some("CLOSE"));
}

#[test]
fn test_lock_failure_aborts_run() {
    let cluster = LocalCluster::new(1);
    let session = FakeSession::failing_on("public.b");
    let backup = Backup::new(cluster.ctx.clone(), cluster.executor(), Box::new(session.clone()));

    let err = backup
        .execute(&catalog(), &CommandUnloader::new(UNLOAD), &ObjectFilter::default())
        .unwrap_err();
    assert!(
        matches!(&err, BackupError::LockAcquisition { relation, .. } if relation == "public.b"),
        "got {err}"
    );
    assert!(!cluster.ctx.dir_for_content(0).exists());
}

#[test]
fn test_dependency_cycle_aborts_before_dispatch() {
    let cluster = LocalCluster::new(1);
    let catalog = SnapshotCatalog::from_json(
        r#"{
            "relations": [
                {"oid": 1, "schema": "public", "name": "x", "kind": "view"},
                {"oid": 2, "schema": "public", "name": "y", "kind": "view"}
            ],
            "edges": [
                {"source": 1, "target_oid": 2, "target": "public.y", "kind": "structural"},
                {"source": 2, "target_oid": 1, "target": "public.x", "kind": "structural"}
            ]
        }"#,
    )
    .unwrap();
    let backup = Backup::new(
        cluster.ctx.clone(),
        cluster.executor(),
        Box::new(FakeSession::new()),
    );

    let err = backup
        .execute(&catalog, &CommandUnloader::new(UNLOAD), &ObjectFilter::default())
        .unwrap_err();
    match err {
        BackupError::DependencyCycle { objects } => {
            assert_eq!(objects, vec!["public.x", "public.y"]);
        }
        other => panic!("expected a dependency cycle, got {other}"),
    }
    assert!(!cluster.ctx.dir_for_content(0).exists());
}

#[test]
fn test_interrupt_while_lock_is_pending() {
    let cluster = LocalCluster::new(1);
    let session = StallingSession::default();
    let backup = Arc::new(Backup::new(
        cluster.ctx.clone(),
        cluster.executor(),
        Box::new(session.clone()),
    ));

    let worker = {
        let backup = Arc::clone(&backup);
        thread::spawn(move || {
            backup.execute(&catalog(), &CommandUnloader::new(UNLOAD), &ObjectFilter::default())
        })
    };
    assert!(
        wait_until(Duration::from_secs(5), || session.is_waiting()),
        "first lock was never requested"
    );

    let start = Instant::now();
    let failures = backup.cleanup(false);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "cleanup blocked for {:?} behind the pending lock",
        start.elapsed()
    );
    assert!(failures.is_empty(), "cleanup failed: {failures:?}");

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, BackupError::LockAcquisition { .. }), "got {err}");
    assert!(session.is_closed());
    assert!(!cluster.ctx.dir_for_content(0).exists());
}

/// Signals that the unload started, then takes a while without writing
/// anything, leaving every reader blocked on its pipe.
struct SlowUnloader {
    started: Arc<AtomicBool>,
}

impl DataUnloader for SlowUnloader {
    fn unload(&self, _: &RunContext, _: &ClusterExecutor, _: &[Relation]) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }
}

#[test]
fn test_interrupt_during_unload_stops_readers() {
    let cluster = LocalCluster::new(2);
    let ctx = cluster.ctx.clone();
    let session = FakeSession::new();
    let backup = Arc::new(Backup::new(
        ctx.clone(),
        cluster.executor(),
        Box::new(session.clone()),
    ));
    let started = Arc::new(AtomicBool::new(false));

    let worker = {
        let backup = Arc::clone(&backup);
        let unloader = SlowUnloader {
            started: Arc::clone(&started),
        };
        thread::spawn(move || backup.execute(&catalog(), &unloader, &ObjectFilter::default()))
    };
    assert!(
        wait_until(Duration::from_secs(10), || started.load(Ordering::SeqCst)),
        "unload never started"
    );

    assert!(backup.cleanup(false).is_empty());
    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, BackupError::Interrupted), "got {err}");

    for id in 0..2 {
        let pattern = ctx.process_pattern(id);
        assert!(
            wait_until(Duration::from_secs(5), || processes_matching(&pattern).is_empty()),
            "reader for {pattern} survived the interrupt"
        );
        assert!(!ctx.segment_pipe_path(id).exists());
        assert!(!ctx.segment_toc_path(id).exists(), "segment {id} was finalized");
    }
    assert_eq!(session.statements().last().map(String::as_str), Some("CLOSE"));
}
