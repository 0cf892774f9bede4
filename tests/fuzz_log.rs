//! Randomized operation sequences checked against an in-memory model.

mod common;

use common::mem_pool;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use verslog::{Hlc, PersistLog};

struct ModelEntry {
    ver: i64,
    payload: Vec<u8>,
}

#[test]
fn fuzz_operations_match_model() {
    for seed in 0..4u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let log = PersistLog::open(mem_pool(), &format!("fuzz-{seed}")).unwrap();

        // Model: entries[i] describes absolute index i; the live window
        // is [head, entries.len()).
        let mut entries: Vec<ModelEntry> = Vec::new();
        let mut head: usize = 0;
        let mut ver = 0i64;
        let mut clock = 0u64;

        for _ in 0..200 {
            match rng.gen_range(0u8..100) {
                // Append with a randomly advancing version and clock.
                0..=59 => {
                    ver += rng.gen_range(1..4);
                    clock += rng.gen_range(0..3);
                    let len = rng.gen_range(0..512usize);
                    let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

                    log.append(&payload, ver, Hlc::new(clock, 0)).unwrap();
                    entries.push(ModelEntry { ver, payload });
                }
                // Trim at a random version.
                60..=69 => {
                    if entries.len() > head {
                        let pick = rng.gen_range(0..=ver);
                        log.trim(pick).unwrap();
                        while head < entries.len() && entries[head].ver <= pick {
                            head += 1;
                        }
                    }
                }
                // Truncate at a random version.
                70..=79 => {
                    if entries.len() > head {
                        let pick = rng.gen_range(0..=ver);
                        log.truncate(pick).unwrap();
                        while entries.len() > head && entries[entries.len() - 1].ver > pick {
                            entries.pop();
                        }
                    }
                }
                // Read a random live entry back.
                _ => {
                    if entries.len() > head {
                        let index = rng.gen_range(head..entries.len());
                        let expected = &entries[index];
                        assert_eq!(log.entry_by_index(index as i64).unwrap(), expected.payload);
                        assert_eq!(log.version_index(expected.ver).unwrap(), index as i64);
                        assert_eq!(log.entry(expected.ver).unwrap(), expected.payload);
                    }
                }
            }

            assert_eq!(log.length(), (entries.len() - head) as i64);
            if entries.len() > head {
                assert_eq!(log.earliest_index(), head as i64);
                assert_eq!(log.latest_index(), entries.len() as i64 - 1);
                assert_eq!(log.latest_version(), entries[entries.len() - 1].ver);
                assert_eq!(log.earliest_version().unwrap(), entries[head].ver);
            }
        }
    }
}
