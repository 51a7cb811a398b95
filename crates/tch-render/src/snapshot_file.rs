//! Snapshot files on the desk's disk.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tch_schemas::OrderId;
use tracing::debug;

use crate::{RenderError, Snapshot};

/// `order_{id}_formal_{epoch_millis}.png`
pub fn snapshot_file_name(order_id: OrderId, epoch_millis: i64) -> String {
    format!("order_{order_id}_formal_{epoch_millis}.png")
}

/// Write `snapshot` under `dir` with a fresh timestamped name.
///
/// The bytes go to a `.part` file first and are renamed into place, so a
/// file with the final name is always complete.
pub async fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf, RenderError> {
    let wrap = |path: &Path, source: std::io::Error| RenderError::SnapshotWrite {
        path: path.display().to_string(),
        source,
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| wrap(dir, e))?;

    let path = dir.join(snapshot_file_name(
        snapshot.order_id,
        Utc::now().timestamp_millis(),
    ));
    let part = path.with_extension("png.part");

    tokio::fs::write(&part, &snapshot.png)
        .await
        .map_err(|e| wrap(&part, e))?;
    tokio::fs::rename(&part, &path)
        .await
        .map_err(|e| wrap(&path, e))?;

    debug!(order_id = snapshot.order_id, path = %path.display(), bytes = snapshot.png.len(), "snapshot written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_deterministic_per_order_and_timestamp() {
        assert_eq!(
            snapshot_file_name(7, 1_760_000_000_123),
            "order_7_formal_1760000000123.png"
        );
    }

    #[tokio::test]
    async fn writes_complete_file_without_leftover_part() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot {
            order_id: 7,
            width: 1,
            height: 1,
            png: vec![1, 2, 3],
        };
        let path = write_snapshot(&dir.path().join("formal"), &snap).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1, "got: {names:?}");
        assert!(names[0].starts_with("order_7_formal_"));
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_snapshot_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        let snap = Snapshot {
            order_id: 1,
            width: 1,
            height: 1,
            png: vec![0],
        };
        let err = write_snapshot(&blocker, &snap).await.unwrap_err();
        assert!(matches!(err, RenderError::SnapshotWrite { .. }), "got: {err}");
    }
}
