// Concurrency: readers proceed against a writing database, iterators stay
// coherent across flushes, and shutdown waits for background work.

use siltdb::{Options, ReadOptions, DB};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Arc<DB> {
    Arc::new(
        DB::open(
            dir.path(),
            Options::new().create_if_missing(true).write_buffer_size(128 << 10),
        )
        .unwrap(),
    )
}

#[test]
fn test_readers_run_alongside_writer() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for i in 0..1000u32 {
        db.put(format!("stable{:05}", i).as_bytes(), b"fixed").unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for t in 0..4u32 {
        let db = db.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut hits = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let i = (hits * 7 + t as u64 * 13) % 1000;
                let value = db.get(format!("stable{:05}", i).as_bytes()).unwrap();
                assert_eq!(value, Some(b"fixed".to_vec()));
                hits += 1;
            }
            hits
        }));
    }

    // Concurrent writes to a different key range, enough to force flushes.
    for i in 0..2000u32 {
        db.put(format!("churn{:05}", i).as_bytes(), &vec![b'c'; 512]).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        let hits = reader.join().unwrap();
        assert!(hits > 0);
    }
}

#[test]
fn test_iterator_is_stable_while_writes_continue() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for i in 0..500u32 {
        db.put(format!("key{:05}", i).as_bytes(), b"original").unwrap();
    }

    // The iterator pins its snapshot at creation time.
    let mut iter = db.iter(&ReadOptions::new()).unwrap();

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for i in 0..500u32 {
                db.put(format!("key{:05}", i).as_bytes(), b"rewritten").unwrap();
            }
            for i in 500..700u32 {
                db.put(format!("key{:05}", i).as_bytes(), b"new").unwrap();
            }
        })
    };

    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.value(), b"original");
        count += 1;
        iter.next();
    }
    assert_eq!(count, 500);

    writer.join().unwrap();
    assert_eq!(db.get(b"key00000").unwrap(), Some(b"rewritten".to_vec()));
    assert_eq!(db.get(b"key00699").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_mixed_batch_writers_and_point_readers() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let mut handles = Vec::new();
    for t in 0..3u32 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            for i in 0..300u32 {
                let mut batch = siltdb::WriteBatch::new();
                batch.put(format!("w{}k{:04}", t, i).as_bytes(), b"v");
                batch.delete(format!("w{}k{:04}", t, i.saturating_sub(10)).as_bytes());
                db.write(&siltdb::WriteOptions::default(), batch).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // The last ten keys of each writer survive, older ones were deleted.
    for t in 0..3u32 {
        for i in 290..300u32 {
            assert_eq!(db.get(format!("w{}k{:04}", t, i).as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
        assert_eq!(db.get(format!("w{}k{:04}", t, 100).as_bytes()).unwrap(), None);
    }
}

#[test]
fn test_drop_waits_for_background_work() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        // Enough data to leave a flush in flight at drop time.
        for i in 0..2000u32 {
            db.put(format!("key{:05}", i).as_bytes(), &vec![b'z'; 512]).unwrap();
        }
    }
    // Reopening immediately must find a consistent database.
    let db = open_db(&dir);
    for i in (0..2000u32).step_by(191) {
        assert_eq!(db.get(format!("key{:05}", i).as_bytes()).unwrap(), Some(vec![b'z'; 512]));
    }
}
