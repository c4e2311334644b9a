#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{path::PathBuf, sync::Arc};

use courier_common::Message;
use courier_spool::{
    FailedRecord, FailureOrigin, FailureSpool, FailureStore, FileStore, PathError, SpoolError,
};

fn store_in(dir: &tempfile::TempDir) -> FileStore {
    let mut store = FileStore::builder()
        .path(dir.path().join("failed"))
        .build()
        .expect("valid path");
    store.init().expect("init");
    store
}

fn record() -> FailedRecord {
    let message = Message::new()
        .to("a@x.com")
        .from("Courier <no-reply@x.com>")
        .subject("Receipt #42")
        .html("<h1>Thanks</h1>")
        .text("Thanks")
        .header("X-Order", "42");

    FailedRecord::new(message, "Connectivity error: connection refused", FailureOrigin::RetriesExhausted, 3)
}

#[test]
fn test_path_validation_rejects_parent_dir() {
    let result = FileStore::builder()
        .path(PathBuf::from("/var/spool/../etc/passwd"))
        .build();

    assert!(matches!(result, Err(PathError::Traversal(_))));
}

#[test]
fn test_path_validation_rejects_relative_paths() {
    let result = FileStore::builder().path("relative/path").build();

    assert!(result.unwrap_err().to_string().contains("must be absolute"));
}

#[test]
#[cfg(unix)]
fn test_path_validation_rejects_unix_system_directories() {
    for path in [
        "/etc/spool",
        "/bin/messages",
        "/sbin/mail",
        "/usr/bin/data",
        "/boot/spool",
        "/sys/messages",
        "/proc/mail",
        "/dev/spool",
    ] {
        let result = FileStore::builder().path(path).build();

        assert!(
            matches!(result, Err(PathError::SystemDirectory { .. })),
            "Path {path} should be rejected but wasn't"
        );
    }
}

#[test]
fn test_init_rejects_file_path() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();

    let mut store = FileStore::builder().path(&file).build().unwrap();
    assert!(matches!(
        store.init(),
        Err(SpoolError::Path(PathError::NotDirectory(_)))
    ));
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File IO")]
async fn test_record_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let original = record();

    {
        let store = store_in(&dir);
        store.write(&original).await.unwrap();
    }

    let reopened = store_in(&dir);
    let ids = reopened.list().await.unwrap();
    assert_eq!(ids, vec![original.id]);

    let restored = reopened.read(&original.id).await.unwrap();
    assert_eq!(restored, original);
    assert_eq!(restored.message.html.as_deref(), Some("<h1>Thanks</h1>"));
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File IO")]
async fn test_delete_and_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    let record = record();

    store.write(&record).await.unwrap();
    assert!(matches!(
        store.write(&record).await,
        Err(SpoolError::AlreadyExists(_))
    ));

    store.delete(&record.id).await.unwrap();
    assert!(store.list().await.unwrap().is_empty());
    assert!(matches!(
        store.read(&record.id).await,
        Err(SpoolError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(&record.id).await,
        Err(SpoolError::NotFound(_))
    ));
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File IO")]
async fn test_init_cleans_leftovers_and_list_ignores_strays() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    let record = record();
    store.write(&record).await.unwrap();

    let root = dir.path().join("failed");
    std::fs::write(root.join(".tmp_01ARZ3NDEKTSV4RRFFQ69G5FAV.bin"), b"partial").unwrap();
    std::fs::write(root.join("01ARZ3NDEKTSV4RRFFQ69G5FAV.bin.deleted"), b"gone").unwrap();
    std::fs::write(root.join("notes.txt"), b"operator notes").unwrap();

    assert_eq!(store.list().await.unwrap(), vec![record.id]);

    let _reopened = store_in(&dir);
    let mut remaining: Vec<_> = std::fs::read_dir(&root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    remaining.sort();

    assert_eq!(remaining, vec![format!("{}.bin", record.id), "notes.txt".to_string()]);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File IO")]
async fn test_spool_over_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let spool = FailureSpool::new(Arc::new(store_in(&dir)));
    let message = record().message;

    let id = spool
        .persist(&message, "circuit open", FailureOrigin::CircuitOpen, 0)
        .await
        .unwrap();

    let records = spool.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].message, message);

    spool.remove(&id).await.unwrap();
    assert_eq!(spool.len().await.unwrap(), 0);
}
