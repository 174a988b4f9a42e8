// Recovery tests: reopening a database must replay the WAL, tolerate torn
// tails, and never resurrect a partial batch.

use siltdb::{Options, WriteBatch, WriteOptions, DB};
use std::fs;
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> DB {
    DB::open(dir.path(), Options::new().create_if_missing(true)).unwrap()
}

// Closing a database does not flush the memtable, so everything written
// since the last flush exists only in the WAL and must be replayed.
#[test]
fn test_reopen_replays_wal() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        for i in 0..100u32 {
            db.put(format!("key_{}", i).as_bytes(), format!("value_{}", i).as_bytes()).unwrap();
        }
    }

    let db = open_db(&dir);
    for i in 0..100u32 {
        assert_eq!(
            db.get(format!("key_{}", i).as_bytes()).unwrap(),
            Some(format!("value_{}", i).into_bytes()),
            "key_{} lost across reopen",
            i
        );
    }
}

#[test]
fn test_synced_write_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        db.put_opt(&WriteOptions::sync(), b"sss", b"vvv").unwrap();
    }
    let db = open_db(&dir);
    assert_eq!(db.get(b"sss").unwrap(), Some(b"vvv".to_vec()));
}

#[test]
fn test_reopen_preserves_deletes_and_overwrites() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        db.put(b"kept", b"old").unwrap();
        db.put(b"kept", b"new").unwrap();
        db.put(b"gone", b"x").unwrap();
        db.delete(b"gone").unwrap();
    }
    let db = open_db(&dir);
    assert_eq!(db.get(b"kept").unwrap(), Some(b"new".to_vec()));
    assert_eq!(db.get(b"gone").unwrap(), None);
}

#[test]
fn test_reopen_after_flush_and_more_writes() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        for i in 0..50u32 {
            db.put(format!("table_{}", i).as_bytes(), b"in-table").unwrap();
        }
        db.flush().unwrap();
        for i in 0..50u32 {
            db.put(format!("wal_{}", i).as_bytes(), b"in-wal").unwrap();
        }
    }

    let db = open_db(&dir);
    for i in 0..50u32 {
        assert_eq!(db.get(format!("table_{}", i).as_bytes()).unwrap(), Some(b"in-table".to_vec()));
        assert_eq!(db.get(format!("wal_{}", i).as_bytes()).unwrap(), Some(b"in-wal".to_vec()));
    }
}

#[test]
fn test_sequences_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        db.put(b"first", b"1").unwrap();
    }
    {
        let db = open_db(&dir);
        db.put(b"second", b"2").unwrap();
        // Newer write wins over the recovered one for the same key.
        db.put(b"first", b"updated").unwrap();
    }
    let db = open_db(&dir);
    assert_eq!(db.get(b"first").unwrap(), Some(b"updated".to_vec()));
    assert_eq!(db.get(b"second").unwrap(), Some(b"2".to_vec()));
}

// A torn tail: the last record was half-written when the process died.
// Recovery applies all complete batches and silently drops the tail.
#[test]
fn test_torn_wal_tail_discarded_whole() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        db.put(b"good", b"committed").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"torn-a", &vec![7u8; 4096]);
        batch.put(b"torn-b", &vec![8u8; 4096]);
        db.write(&WriteOptions::default(), batch).unwrap();
    }

    // Chop the newest WAL mid-way through the second record.
    let mut logs: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".log"))
        .collect();
    logs.sort_by_key(|e| e.file_name());
    let log_path = logs.last().unwrap().path();
    let contents = fs::read(&log_path).unwrap();
    assert!(contents.len() > 200);
    fs::write(&log_path, &contents[..contents.len() - 4000]).unwrap();

    let db = open_db(&dir);
    assert_eq!(db.get(b"good").unwrap(), Some(b"committed".to_vec()));
    // The torn batch vanishes as a unit.
    assert_eq!(db.get(b"torn-a").unwrap(), None);
    assert_eq!(db.get(b"torn-b").unwrap(), None);
}

#[test]
fn test_recovery_flushes_oversized_wal() {
    let dir = TempDir::new().unwrap();
    {
        // Large write buffer: everything stays in the WAL.
        let db = DB::open(
            dir.path(),
            Options::new().create_if_missing(true).write_buffer_size(8 << 20),
        )
        .unwrap();
        for i in 0..2000u32 {
            db.put(format!("key{:06}", i).as_bytes(), &vec![b'v'; 512]).unwrap();
        }
    }

    // Reopen with a tiny buffer: replay must spill to level-0 tables.
    let db = DB::open(
        dir.path(),
        Options::new().create_if_missing(true).write_buffer_size(64 << 10),
    )
    .unwrap();
    for i in (0..2000u32).step_by(97) {
        assert_eq!(db.get(format!("key{:06}", i).as_bytes()).unwrap(), Some(vec![b'v'; 512]));
    }
    let total: usize = (0..7).map(|l| db.num_files_at_level(l)).sum();
    assert!(total >= 2, "recovery should have written several tables, saw {}", total);
}

#[test]
fn test_reopen_many_generations() {
    let dir = TempDir::new().unwrap();
    for generation in 0..5u32 {
        let db = open_db(&dir);
        for i in 0..50u32 {
            db.put(
                format!("gen{}_{}", generation, i).as_bytes(),
                format!("g{}", generation).as_bytes(),
            )
            .unwrap();
        }
        drop(db);
    }

    let db = open_db(&dir);
    for generation in 0..5u32 {
        for i in 0..50u32 {
            assert_eq!(
                db.get(format!("gen{}_{}", generation, i).as_bytes()).unwrap(),
                Some(format!("g{}", generation).into_bytes())
            );
        }
    }
}
