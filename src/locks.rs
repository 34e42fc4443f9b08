//! Snapshot locks on every in-scope relation.
//!
//! ACCESS SHARE blocks concurrent schema changes while permitting reads. Locks
//! are taken in ascending identity order before any segment starts unloading
//! and are held until the session ends; there is no explicit release.

use tracing::{debug, error, info};

use crate::catalog::Relation;
use crate::error::{BackupError, Result};
use crate::session::CatalogSession;

/// Lock every lockable relation, returning how many locks were taken.
///
/// On the first failure the session is closed, releasing any locks already
/// held, and the whole run is aborted.
pub fn lock_relations(session: &mut dyn CatalogSession, relations: &[Relation]) -> Result<usize> {
    let mut targets: Vec<&Relation> = relations.iter().filter(|r| r.is_lockable()).collect();
    targets.sort_by_key(|r| r.oid);

    info!("Acquiring ACCESS SHARE locks on {} relations", targets.len());
    for (n, rel) in targets.iter().enumerate() {
        let statement = format!("LOCK TABLE {} IN ACCESS SHARE MODE", rel.fqn());
        if let Err(e) = session.execute(&statement) {
            error!("Failed to lock {}: {}", rel.fqn(), e);
            if let Err(close_err) = session.close() {
                debug!("closing session after lock failure: {}", close_err);
            }
            return Err(BackupError::LockAcquisition {
                relation: rel.fqn(),
                message: e.to_string(),
            });
        }
        debug!("Locks acquired: {}/{}", n + 1, targets.len());
    }
    Ok(targets.len())
}
