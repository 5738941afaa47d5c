//! Default snapshot names: `snap0`, `snap1`, ...

use cellar_common::{snapshot_full_name, CellarError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::Database;

pub const AUTO_SNAPSHOT_PREFIX: &str = "snap";

/// What to do when the store cannot be asked for existing snapshot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingFailurePolicy {
    /// Fail the snapshot request.
    #[default]
    Fail,
    /// Use index 0. A real `snap0` then makes the insert fail with a conflict.
    FallbackToZero,
}

/// Returns the next free `snapN` index for `parent`: one past the largest
/// index in use, or 0 when there is none.
///
/// Names are flat strings. Only remainders made entirely of ASCII digits
/// count; anything else (`snapshot-old`, `snap1a`) is skipped.
pub async fn next_snapshot_index(
    db: &Database,
    parent: &str,
    policy: NamingFailurePolicy,
) -> Result<u64> {
    let base = snapshot_full_name(parent, AUTO_SNAPSHOT_PREFIX);
    let names = match db.snapshot_names_with_prefix(&base).await {
        Ok(names) => names,
        Err(e) => match policy {
            NamingFailurePolicy::Fail => return Err(CellarError::from(e)),
            NamingFailurePolicy::FallbackToZero => {
                warn!(container = %parent, error = %e, "Snapshot name lookup failed, using index 0");
                return Ok(0);
            }
        },
    };

    let next = names
        .iter()
        .filter_map(|name| parse_index(name, &base))
        .max()
        .map_or(0, |max| max.saturating_add(1));
    debug!(container = %parent, next, "Chose snapshot index");
    Ok(next)
}

/// Leaf name for the next automatic snapshot of `parent`.
pub async fn next_snapshot_name(
    db: &Database,
    parent: &str,
    policy: NamingFailurePolicy,
) -> Result<String> {
    let index = next_snapshot_index(db, parent, policy).await?;
    Ok(format!("{AUTO_SNAPSHOT_PREFIX}{index}"))
}

fn parse_index(name: &str, base: &str) -> Option<u64> {
    let rest = name.strip_prefix(base)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_common::{ContainerArgs, ContainerType};

    async fn db_with(snapshots: &[&str]) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.create_container("web", &ContainerArgs::default()).await.unwrap();
        let args = ContainerArgs {
            ctype: ContainerType::Snapshot,
            ..Default::default()
        };
        for name in snapshots {
            db.create_container(name, &args).await.unwrap();
        }
        db
    }

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("web/snap12", "web/snap"), Some(12));
        assert_eq!(parse_index("web/snap", "web/snap"), None);
        assert_eq!(parse_index("web/snap1a", "web/snap"), None);
        assert_eq!(parse_index("web/snap+1", "web/snap"), None);
        assert_eq!(parse_index("web/snap0/snap3", "web/snap"), None);
    }

    #[tokio::test]
    async fn test_no_snapshots_is_zero() {
        let db = db_with(&[]).await;
        let name = next_snapshot_name(&db, "web", NamingFailurePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(name, "snap0");
    }

    #[tokio::test]
    async fn test_max_plus_one_numerically() {
        // "snap9" sorts after "snap10" as a string; the index must not.
        let db = db_with(&["web/snap2", "web/snap10", "web/snap9", "web/backup", "web/snapshot"]).await;
        let next = next_snapshot_index(&db, "web", NamingFailurePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(next, 11);
    }

    #[tokio::test]
    async fn test_other_parents_ignored() {
        let db = db_with(&["web2/snap5", "webx/snap7"]).await;
        let next = next_snapshot_index(&db, "web", NamingFailurePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_policies() {
        let db = db_with(&["web/snap3"]).await;
        db.exec("DROP TABLE containers", vec![]).await.unwrap();

        let err = next_snapshot_index(&db, "web", NamingFailurePolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, CellarError::Persistence(_)));

        let next = next_snapshot_index(&db, "web", NamingFailurePolicy::FallbackToZero)
            .await
            .unwrap();
        assert_eq!(next, 0);
    }
}
