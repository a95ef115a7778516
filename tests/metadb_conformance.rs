//! Behaviour every `MetaDb` backend must share
//!
//! Each property is written once against `&dyn MetaDb` and run for both the
//! in-memory and the sled store.

use shard_renter::config::MetaDbConfig;
use shard_renter::metadb::{check_reference_counts, recompute_reference_counts};
use shard_renter::{
    BlobRecord, ChunkRecord, HostKey, KeySeed, MemoryMetaDb, MetaDb, RenterError, SectorRoot,
    ShardRecord, SledMetaDb,
};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

fn shard(host: u8, root: u8, offset: u32) -> ShardRecord {
    ShardRecord {
        host_key: HostKey([host; 32]),
        sector_root: SectorRoot([root; 32]),
        offset,
        nonce: [host ^ root; 24],
    }
}

fn blob(key: &[u8], chunks: &[u64]) -> BlobRecord {
    BlobRecord {
        key: key.to_vec(),
        chunks: chunks.to_vec(),
        seed: KeySeed::generate(),
    }
}

fn assert_consistent(db: &dyn MetaDb) {
    assert!(check_reference_counts(db).unwrap().is_empty());
}

fn sled_config() -> MetaDbConfig {
    MetaDbConfig {
        flush_every_ms: None,
        ..Default::default()
    }
}

fn blob_round_trip(db: &dyn MetaDb) {
    let chunk = db
        .add_chunk_and_shards(2, 5000, &[shard(1, 1, 0), shard(2, 2, 0), shard(3, 3, 64)])
        .unwrap();
    assert_eq!(chunk.num_shards(), 3);
    assert_eq!(chunk.min_shards, 2);
    assert_eq!(db.get_chunk(chunk.id).unwrap(), chunk);
    assert_eq!(db.get_shard(chunk.shards[2]).unwrap(), shard(3, 3, 64));

    let record = blob(b"photos/beach.jpg", &[chunk.id]);
    db.add_blob(&record).unwrap();
    assert_eq!(db.get_blob(b"photos/beach.jpg").unwrap(), record);
    assert_consistent(db);
}

fn missing_keys_are_not_found(db: &dyn MetaDb) {
    assert!(db.get_blob(b"nope").unwrap_err().is_not_found());
    assert!(db.get_chunk(0).unwrap_err().is_not_found());
    assert!(db.get_chunk(42).unwrap_err().is_not_found());
    assert!(db.get_shard(0).unwrap_err().is_not_found());
    assert!(db.get_shard(42).unwrap_err().is_not_found());
    assert!(db.get_metadata(b"nope").unwrap_err().is_not_found());
}

fn delete_absent_blob_is_noop(db: &dyn MetaDb) {
    db.delete_blob(b"never-added").unwrap();

    let chunk = db.add_chunk_and_shards(1, 10, &[shard(1, 1, 0)]).unwrap();
    db.add_blob(&blob(b"a", &[chunk.id])).unwrap();
    db.delete_blob(b"a").unwrap();
    db.delete_blob(b"a").unwrap();
    assert!(db.get_blob(b"a").unwrap_err().is_not_found());
    assert!(db.reference_counts().unwrap().is_empty());
}

fn duplicate_key_leaves_state_unchanged(db: &dyn MetaDb) {
    let first = db.add_chunk_and_shards(1, 10, &[shard(1, 1, 0)]).unwrap();
    let second = db.add_chunk_and_shards(1, 10, &[shard(2, 2, 0)]).unwrap();
    let original = blob(b"k", &[first.id]);
    db.add_blob(&original).unwrap();

    let err = db.add_blob(&blob(b"k", &[second.id])).unwrap_err();
    assert!(matches!(err, RenterError::DuplicateKey(_)));
    assert_eq!(db.get_blob(b"k").unwrap(), original);
    assert_eq!(
        db.reference_counts().unwrap(),
        HashMap::from([(first.shards[0], 1)])
    );
}

fn blob_with_unknown_chunk_is_refused(db: &dyn MetaDb) {
    let chunk = db.add_chunk_and_shards(1, 10, &[shard(1, 1, 0)]).unwrap();
    let err = db.add_blob(&blob(b"k", &[chunk.id, 999])).unwrap_err();
    assert!(err.is_not_found());
    assert!(db.get_blob(b"k").unwrap_err().is_not_found());
    assert!(db.reference_counts().unwrap().is_empty());
}

fn fill_chunk_slot_by_slot(db: &dyn MetaDb) {
    let chunk = db.add_chunk(2, 4, 1000).unwrap();
    assert_eq!(chunk.shards, vec![0; 4]);
    db.add_blob(&blob(b"k", &[chunk.id])).unwrap();

    let ids: Vec<u64> = (0..4u8)
        .map(|i| db.add_shard(&shard(i + 1, i + 1, 0)).unwrap())
        .collect();
    for (slot, id) in ids.iter().enumerate() {
        db.set_chunk_shard(chunk.id, slot, *id).unwrap();
    }
    assert_eq!(db.get_chunk(chunk.id).unwrap().shards, ids);
    for id in &ids {
        assert_eq!(db.reference_counts().unwrap()[id], 1);
    }

    // Clearing and repointing a slot moves the reference.
    db.set_chunk_shard(chunk.id, 0, 0).unwrap();
    assert!(!db.reference_counts().unwrap().contains_key(&ids[0]));
    db.set_chunk_shard(chunk.id, 1, ids[0]).unwrap();
    let counts = db.reference_counts().unwrap();
    assert_eq!(counts[&ids[0]], 1);
    assert!(!counts.contains_key(&ids[1]));
    assert_consistent(db);
}

fn set_chunk_shard_errors(db: &dyn MetaDb) {
    let chunk = db.add_chunk(1, 2, 10).unwrap();
    let shard_id = db.add_shard(&shard(1, 1, 0)).unwrap();

    assert!(matches!(
        db.set_chunk_shard(chunk.id, 2, shard_id),
        Err(RenterError::InvalidParameters(_))
    ));
    assert!(db.set_chunk_shard(chunk.id, 0, 77).unwrap_err().is_not_found());
    assert!(db.set_chunk_shard(77, 0, shard_id).unwrap_err().is_not_found());
    assert_eq!(db.get_chunk(chunk.id).unwrap().shards, vec![0, 0]);
}

fn blobs_iterate_in_key_order(db: &dyn MetaDb) {
    for key in [b"m".as_slice(), b"a", b"z", b"b\x00", b"b"] {
        db.add_blob(&blob(key, &[])).unwrap();
    }
    // Shards are unrelated to blob iteration.
    db.add_shard(&shard(1, 1, 0)).unwrap();

    assert_eq!(
        db.blob_keys().unwrap(),
        vec![b"a".to_vec(), b"b".to_vec(), b"b\x00".to_vec(), b"m".to_vec(), b"z".to_vec()]
    );

    let mut seen = Vec::new();
    let flow = db
        .for_each_blob(&mut |key| {
            seen.push(key.to_vec());
            if seen.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
    assert!(flow.is_break());
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
}

fn shared_chunks_count_every_entry(db: &dyn MetaDb) {
    let chunk = db
        .add_chunk_and_shards(1, 10, &[shard(1, 1, 0), shard(2, 2, 0)])
        .unwrap();
    db.add_blob(&blob(b"one", &[chunk.id])).unwrap();
    db.add_blob(&blob(b"twice", &[chunk.id, chunk.id])).unwrap();

    let counts = db.reference_counts().unwrap();
    assert_eq!(counts[&chunk.shards[0]], 3);
    assert_eq!(counts[&chunk.shards[1]], 3);
    assert_eq!(counts, recompute_reference_counts(db).unwrap());

    db.delete_blob(b"twice").unwrap();
    assert_eq!(db.reference_counts().unwrap()[&chunk.shards[0]], 1);

    // Repointing a slot of a chunk listed twice moves both references.
    db.add_blob(&blob(b"twice", &[chunk.id, chunk.id])).unwrap();
    let spare = db.add_shard(&shard(3, 3, 0)).unwrap();
    db.set_chunk_shard(chunk.id, 0, spare).unwrap();
    let counts = db.reference_counts().unwrap();
    assert_eq!(counts[&spare], 3);
    assert!(!counts.contains_key(&chunk.shards[0]));
    assert_consistent(db);
}

fn unreferenced_sectors_follow_live_blobs(db: &dyn MetaDb) {
    // Two shards packed into one sector on host 1, one sector on host 2.
    let a = db
        .add_chunk_and_shards(1, 10, &[shard(1, 7, 0), shard(2, 8, 0)])
        .unwrap();
    let b = db.add_chunk_and_shards(1, 10, &[shard(1, 7, 4096)]).unwrap();
    // A sector nothing ever referenced.
    db.add_shard(&shard(3, 9, 0)).unwrap();

    db.add_blob(&blob(b"a", &[a.id])).unwrap();
    db.add_blob(&blob(b"b", &[b.id])).unwrap();
    let report = db.unreferenced_sectors().unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[&HostKey([3; 32])], vec![SectorRoot([9; 32])]);

    // Host 1's sector still holds a live shard of "b".
    db.delete_blob(b"a").unwrap();
    let report = db.unreferenced_sectors().unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report[&HostKey([2; 32])], vec![SectorRoot([8; 32])]);
    assert!(!report.contains_key(&HostKey([1; 32])));

    db.delete_blob(b"b").unwrap();
    let report = db.unreferenced_sectors().unwrap();
    assert_eq!(report[&HostKey([1; 32])], vec![SectorRoot([7; 32])]);
    assert_eq!(report.values().map(Vec::len).sum::<usize>(), 3);
}

fn failed_chunk_allocation_leaves_no_shards(db: &dyn MetaDb) {
    assert!(matches!(
        db.add_chunk_and_shards(0, 10, &[shard(1, 1, 0)]),
        Err(RenterError::InvalidParameters(_))
    ));
    assert!(matches!(
        db.add_chunk_and_shards(3, 10, &[shard(1, 1, 0), shard(2, 2, 0)]),
        Err(RenterError::InvalidParameters(_))
    ));
    assert!(matches!(
        db.add_chunk(2, 1, 10),
        Err(RenterError::InvalidParameters(_))
    ));

    // No ids were consumed by the failed calls.
    assert_eq!(db.add_shard(&shard(1, 1, 0)).unwrap(), 1);
    assert_eq!(db.add_chunk(1, 1, 10).unwrap().id, 1);
    assert!(db.unreferenced_sectors().unwrap().values().all(|r| r.len() == 1));
}

fn metadata_overwrites(db: &dyn MetaDb) {
    db.add_metadata(b"last-gc", b"monday").unwrap();
    db.add_metadata(b"last-gc", b"tuesday").unwrap();
    assert_eq!(db.get_metadata(b"last-gc").unwrap(), b"tuesday");
}

fn closed_store_refuses_work(db: &dyn MetaDb) {
    db.close().unwrap();
    db.close().unwrap();
    assert!(db.get_blob(b"k").is_err());
    assert!(db.add_shard(&shard(1, 1, 0)).is_err());
}

fn metadata_namespace_belongs_to_callers(db: &dyn MetaDb) {
    assert!(db.get_metadata(b"format-version").unwrap_err().is_not_found());
    db.add_metadata(b"format-version", b"v2-tag").unwrap();
    assert_eq!(db.get_metadata(b"format-version").unwrap(), b"v2-tag");
}

fn concurrent_writers_keep_counts_exact(db: &dyn MetaDb) {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 50;
    const SLOTS: usize = 4;

    let chunks: Vec<ChunkRecord> = (0..2u8)
        .map(|c| {
            let shards: Vec<ShardRecord> = (0..SLOTS as u8).map(|s| shard(c, s, 0)).collect();
            db.add_chunk_and_shards(1, 10, &shards).unwrap()
        })
        .collect();
    let spares: Vec<u64> = (0..4u8).map(|i| db.add_shard(&shard(9, i, 0)).unwrap()).collect();
    let chunk_ids: Vec<u64> = chunks.iter().map(|c| c.id).collect();
    let known: Vec<u64> = chunks
        .iter()
        .flat_map(|c| c.shards.iter().copied())
        .chain(spares)
        .collect();
    let known_set: HashSet<u64> = known.iter().copied().collect();

    // Each writer keeps at most 3 blobs of 2 chunk entries; a shard can fill every slot.
    let ceiling = (WRITERS * 3 * 2 * SLOTS) as u64;
    let writers_done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let (chunk_ids, known, known_set) = (&chunk_ids, &known, &known_set);
        let writers_done = &writers_done;

        let reader = scope.spawn(move || {
            while !writers_done.load(Ordering::Acquire) {
                for (shard_id, count) in db.reference_counts().unwrap() {
                    assert!(known_set.contains(&shard_id), "count for unknown shard {}", shard_id);
                    assert!(
                        count > 0 && count <= ceiling,
                        "shard {} has count {}",
                        shard_id,
                        count
                    );
                }
                for id in chunk_ids {
                    let chunk = db.get_chunk(*id).unwrap();
                    assert_eq!(chunk.shards.len(), SLOTS);
                    assert!(chunk.shards.iter().all(|s| known_set.contains(s)));
                }
                for key in db.blob_keys().unwrap() {
                    match db.get_blob(&key) {
                        Ok(blob) => assert_eq!(blob.chunks.len(), 2),
                        Err(e) => assert!(e.is_not_found()),
                    }
                }
            }
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|t| {
                scope.spawn(move || {
                    for i in 0..ROUNDS {
                        let key = format!("w{}-{}", t, i % 3);
                        let entries = [chunk_ids[i % 2], chunk_ids[(i + t) % 2]];
                        match db.add_blob(&blob(key.as_bytes(), &entries)) {
                            Ok(()) | Err(RenterError::DuplicateKey(_)) => {}
                            Err(e) => panic!("add_blob failed: {}", e),
                        }

                        let chunk = chunk_ids[(t + i) % 2];
                        let shard_id = known[(t * 7 + i) % known.len()];
                        db.set_chunk_shard(chunk, (t + i) % SLOTS, shard_id).unwrap();

                        let stale = format!("w{}-{}", t, (i + 1) % 3);
                        db.delete_blob(stale.as_bytes()).unwrap();
                    }
                })
            })
            .collect();

        let results: Vec<_> = writers.into_iter().map(|w| w.join()).collect();
        writers_done.store(true, Ordering::Release);
        reader.join().unwrap();
        for result in results {
            result.unwrap();
        }
    });

    assert_consistent(db);
    assert_eq!(
        db.reference_counts().unwrap(),
        recompute_reference_counts(db).unwrap()
    );
}

macro_rules! conformance {
    ($($name:ident),* $(,)?) => {
        mod memory_backend {
            use super::*;
            $(
                #[test]
                fn $name() {
                    let db = MemoryMetaDb::new();
                    super::$name(&db);
                }
            )*
        }

        mod sled_backend {
            use super::*;
            $(
                #[test]
                fn $name() {
                    let temp_dir = TempDir::new().unwrap();
                    let db = SledMetaDb::open(temp_dir.path().join("metadata.sled"), &sled_config())
                        .unwrap();
                    super::$name(&db);
                }
            )*
        }
    };
}

conformance!(
    blob_round_trip,
    missing_keys_are_not_found,
    delete_absent_blob_is_noop,
    duplicate_key_leaves_state_unchanged,
    blob_with_unknown_chunk_is_refused,
    fill_chunk_slot_by_slot,
    set_chunk_shard_errors,
    blobs_iterate_in_key_order,
    shared_chunks_count_every_entry,
    unreferenced_sectors_follow_live_blobs,
    failed_chunk_allocation_leaves_no_shards,
    metadata_overwrites,
    closed_store_refuses_work,
    metadata_namespace_belongs_to_callers,
    concurrent_writers_keep_counts_exact,
);

#[test]
fn test_sled_close_then_reopen_same_path() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metadata.sled");

    let first = SledMetaDb::open(&path, &sled_config()).unwrap();
    let chunk = first.add_chunk_and_shards(1, 10, &[shard(1, 1, 0)]).unwrap();
    first.add_blob(&blob(b"kept", &[chunk.id])).unwrap();
    first.close().unwrap();

    let second = SledMetaDb::open(&path, &sled_config()).unwrap();
    assert_eq!(second.blob_keys().unwrap(), vec![b"kept".to_vec()]);
    assert_eq!(second.reference_counts().unwrap()[&chunk.shards[0]], 1);
    assert!(first.get_blob(b"kept").is_err());
}

#[test]
fn test_sled_reopen_restores_graph_and_counts() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metadata.sled");

    let (chunk, counts) = {
        let db = SledMetaDb::open(&path, &sled_config()).unwrap();
        let chunk = db
            .add_chunk_and_shards(2, 100, &[shard(1, 1, 0), shard(2, 2, 0), shard(3, 3, 0)])
            .unwrap();
        db.add_blob(&blob(b"kept", &[chunk.id, chunk.id])).unwrap();
        db.add_blob(&blob(b"dropped", &[chunk.id])).unwrap();
        db.delete_blob(b"dropped").unwrap();
        db.add_metadata(b"owner", b"alice").unwrap();
        let counts = db.reference_counts().unwrap();
        db.close().unwrap();
        (chunk, counts)
    };

    let db = SledMetaDb::open(&path, &sled_config()).unwrap();
    assert_eq!(db.get_chunk(chunk.id).unwrap(), chunk);
    assert_eq!(db.blob_keys().unwrap(), vec![b"kept".to_vec()]);
    assert_eq!(db.get_metadata(b"owner").unwrap(), b"alice");
    assert_eq!(db.reference_counts().unwrap(), counts);
    assert_eq!(counts[&chunk.shards[0]], 2);
    assert_consistent(&db);

    // Fresh ids continue after the persisted ones.
    assert_eq!(db.add_shard(&shard(4, 4, 0)).unwrap(), 4);
}

#[test]
fn test_open_metadb_honours_backend() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = shard_renter::Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    config.metadb.flush_every_ms = None;

    let db = shard_renter::open_metadb(&config).unwrap();
    db.add_metadata(b"k", b"v").unwrap();
    db.close().unwrap();
    assert!(config.metadata_db_path().exists());

    config.metadb.backend = shard_renter::MetaDbBackend::Memory;
    let db = shard_renter::open_metadb(&config).unwrap();
    assert!(db.get_metadata(b"k").unwrap_err().is_not_found());
}
