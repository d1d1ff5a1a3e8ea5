use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hpdispatch::storage::{FileJournal, JournalStorage, MemoryStorage, SqliteStorage, Storage};

mod reclaim;
mod resume;

fn temp_path(ext: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("hpdispatch_ledger_{nanos}_{}.{ext}", fastrand::u32(..)))
}

/// One store of each local backend, with the files to clean up.
fn stores() -> Vec<(&'static str, Arc<dyn Storage>, Option<PathBuf>)> {
    let journal = temp_path("jsonl");
    let sqlite = temp_path("db");
    vec![
        ("memory", Arc::new(MemoryStorage::new()), None),
        (
            "journal",
            Arc::new(JournalStorage::new(FileJournal::new(&journal))),
            Some(journal),
        ),
        (
            "sqlite",
            Arc::new(SqliteStorage::open(&sqlite, None).unwrap()),
            Some(sqlite),
        ),
    ]
}

fn cleanup(path: Option<PathBuf>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(&path);
        for suffix in ["-wal", "-shm", ".lock"] {
            let mut side = path.clone().into_os_string();
            side.push(suffix);
            let _ = std::fs::remove_file(side);
        }
    }
}
