mod common;

use std::sync::Arc;
use std::thread;

use common::mem_pool;
use verslog::{Hlc, PersistLog};

#[test]
fn test_logs_append_concurrently() {
    let pool = mem_pool();
    let threads = 4;
    let entries_per_log = 16;

    let mut handles = Vec::new();
    for thread_id in 0..threads {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            let name = format!("log-{thread_id}");
            let log = PersistLog::open(pool, &name).unwrap();
            for ver in 1..=entries_per_log {
                let payload = format!("{name}:{ver}");
                log.append(payload.as_bytes(), ver, Hlc::new(ver as u64, 0))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for thread_id in 0..threads {
        let name = format!("log-{thread_id}");
        let log = PersistLog::open(Arc::clone(&pool), &name).unwrap();
        assert_eq!(log.length(), entries_per_log);
        for ver in 1..=entries_per_log {
            assert_eq!(
                log.entry(ver).unwrap(),
                format!("{name}:{ver}").as_bytes()
            );
        }
    }
}

#[test]
fn test_readers_observe_consistent_windows() {
    let pool = mem_pool();
    let log = Arc::new(PersistLog::open(pool, "shared").unwrap());

    let writer = {
        let log = Arc::clone(&log);
        thread::spawn(move || {
            for ver in 1..=64 {
                log.append(format!("v{ver}").as_bytes(), ver, Hlc::new(ver as u64, 0))
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for _ in 0..200 {
                    let earliest = log.earliest_index();
                    let latest = log.latest_index();
                    assert!(earliest >= 0);
                    assert!(latest >= earliest - 1);

                    let ver = log.latest_version();
                    if ver > 0 {
                        // Every committed version stays readable.
                        let payload = log.entry(ver).unwrap();
                        assert!(!payload.is_empty());
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(log.length(), 64);
    assert_eq!(log.latest_version(), 64);
}
