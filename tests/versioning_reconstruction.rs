#![allow(missing_docs)]

use rastro::{IndexKind, Resource, ResourceConfig, Versioning};
use tempfile::tempdir;

fn resource_with(dir: &std::path::Path, versioning: Versioning, revs: u32) -> Resource {
    Resource::create(
        dir.join("res"),
        ResourceConfig::new(1, 1)
            .with_backend("file-channel")
            .with_versioning(versioning)
            .with_revs_to_restore(revs),
    )
    .expect("create resource")
}

/// Ten commits touching disjoint slots of the same leaf; every revision must
/// reconstruct the exact prefix of records it committed, whatever the
/// strategy and window.
fn disjoint_slot_updates(versioning: Versioning, revs: u32) -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = resource_with(dir.path(), versioning, revs);

    let mut txn = resource.begin_write()?;
    for i in 0..10u64 {
        let record = txn.create_record(1, vec![i as u8; 8], None, IndexKind::Document, 0)?;
        assert_eq!(record.node_key, i);
        txn.commit(None, None, false)?;
    }
    drop(txn);
    assert_eq!(resource.latest_revision(), Some(10));

    // Revision 10 sees the slot-union of the whole chain.
    let head = resource.begin_read()?;
    for i in 0..10u64 {
        let record = head
            .get_record(i, IndexKind::Document, 0)?
            .unwrap_or_else(|| panic!("record {i} missing at head ({versioning:?})"));
        assert_eq!(record.payload, vec![i as u8; 8]);
    }

    // Every historical revision reconstructs exactly its own prefix.
    for revision in 1..=10u32 {
        let read = resource.begin_read_at(revision)?;
        for i in 0..10u64 {
            let record = read.get_record(i, IndexKind::Document, 0)?;
            if i < u64::from(revision) {
                assert_eq!(
                    record.expect("prefix record").payload,
                    vec![i as u8; 8],
                    "revision {revision} record {i} ({versioning:?})"
                );
            } else {
                assert!(record.is_none(), "revision {revision} leaked record {i}");
            }
        }
    }
    Ok(())
}

#[test]
fn full_reconstruction() -> rastro::Result<()> {
    disjoint_slot_updates(Versioning::Full, 1)
}

#[test]
fn differential_reconstruction() -> rastro::Result<()> {
    disjoint_slot_updates(Versioning::Differential, 4)
}

#[test]
fn incremental_reconstruction() -> rastro::Result<()> {
    disjoint_slot_updates(Versioning::Incremental, 4)
}

#[test]
fn sliding_snapshot_reconstruction() -> rastro::Result<()> {
    disjoint_slot_updates(Versioning::SlidingSnapshot, 4)
}

/// Overwrites of one slot across many commits: the latest fragment must win
/// on reconstruction, and history must stay intact for the window to slide
/// over.
fn overwrite_chain(versioning: Versioning, revs: u32, commits: u32) -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = resource_with(dir.path(), versioning, revs);

    let mut txn = resource.begin_write()?;
    let key = txn
        .create_record(1, 0u32.to_be_bytes().to_vec(), None, IndexKind::Document, 0)?
        .node_key;
    txn.commit(None, None, false)?;
    for value in 1..commits {
        let record = txn.prepare_record_for_modification(key, IndexKind::Document, 0)?;
        record.payload = value.to_be_bytes().to_vec();
        txn.update_record_slot(key, IndexKind::Document, 0)?;
        txn.commit(None, None, false)?;
    }
    drop(txn);

    for revision in 1..=commits {
        let read = resource.begin_read_at(revision)?;
        let record = read.get_record(key, IndexKind::Document, 0)?.unwrap();
        assert_eq!(
            record.payload,
            (revision - 1).to_be_bytes().to_vec(),
            "revision {revision} ({versioning:?})"
        );
    }
    Ok(())
}

#[test]
fn full_overwrite_chain() -> rastro::Result<()> {
    overwrite_chain(Versioning::Full, 1, 12)
}

#[test]
fn differential_overwrite_chain() -> rastro::Result<()> {
    overwrite_chain(Versioning::Differential, 3, 12)
}

#[test]
fn incremental_overwrite_chain() -> rastro::Result<()> {
    overwrite_chain(Versioning::Incremental, 3, 12)
}

#[test]
fn sliding_snapshot_overwrite_chain() -> rastro::Result<()> {
    overwrite_chain(Versioning::SlidingSnapshot, 3, 12)
}

/// The sliding window must not lose a slot that is only present in the
/// oldest fragment when the window slides past it.
#[test]
fn sliding_snapshot_keeps_cold_slots_alive() -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = resource_with(dir.path(), Versioning::SlidingSnapshot, 3);

    let mut txn = resource.begin_write()?;
    // Revision 1 writes the cold record; it is never touched again.
    let cold = txn
        .create_record(1, b"cold".to_vec(), None, IndexKind::Document, 0)?
        .node_key;
    txn.commit(None, None, false)?;
    // Twelve more commits hammer a different slot of the same leaf.
    let hot = txn
        .create_record(1, b"hot-0".to_vec(), None, IndexKind::Document, 0)?
        .node_key;
    txn.commit(None, None, false)?;
    for i in 1..12u32 {
        let record = txn.prepare_record_for_modification(hot, IndexKind::Document, 0)?;
        record.payload = format!("hot-{i}").into_bytes();
        txn.update_record_slot(hot, IndexKind::Document, 0)?;
        txn.commit(None, None, false)?;
    }
    drop(txn);

    let head = resource.begin_read()?;
    assert_eq!(
        head.get_record(cold, IndexKind::Document, 0)?.unwrap().payload,
        b"cold".to_vec()
    );
    assert_eq!(
        head.get_record(hot, IndexKind::Document, 0)?.unwrap().payload,
        b"hot-11".to_vec()
    );
    Ok(())
}

/// Tombstones must shadow older fragments for as long as the removed
/// record's old value is still inside the reconstruction window.
#[test]
fn removal_survives_window_slides() -> rastro::Result<()> {
    for versioning in [
        Versioning::Full,
        Versioning::Differential,
        Versioning::Incremental,
        Versioning::SlidingSnapshot,
    ] {
        let dir = tempdir().expect("tmpdir");
        let resource = resource_with(dir.path(), versioning, 3);

        let mut txn = resource.begin_write()?;
        let key = txn
            .create_record(1, b"doomed".to_vec(), None, IndexKind::Document, 0)?
            .node_key;
        let other = txn
            .create_record(1, b"other".to_vec(), None, IndexKind::Document, 0)?
            .node_key;
        txn.commit(None, None, false)?;
        txn.remove_record(key, IndexKind::Document, 0)?;
        txn.commit(None, None, false)?;
        for i in 0..6u32 {
            let record = txn.prepare_record_for_modification(other, IndexKind::Document, 0)?;
            record.payload = vec![i as u8];
            txn.update_record_slot(other, IndexKind::Document, 0)?;
            txn.commit(None, None, false)?;
        }
        drop(txn);

        let head = resource.begin_read()?;
        assert!(
            head.get_record(key, IndexKind::Document, 0)?.is_none(),
            "{versioning:?} resurrected a removed record"
        );
        let old = resource.begin_read_at(1)?;
        assert!(old.get_record(key, IndexKind::Document, 0)?.is_some());
    }
    Ok(())
}

/// Records spread across multiple leaves exercise the indirect trie walk on
/// both sides.
#[test]
fn records_across_leaf_boundaries() -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = resource_with(dir.path(), Versioning::SlidingSnapshot, 3);

    let mut txn = resource.begin_write()?;
    // 1024 slots per leaf: 2600 records span three leaves.
    let mut keys = Vec::new();
    for i in 0..2600u64 {
        keys.push(
            txn.create_record(1, i.to_be_bytes().to_vec(), None, IndexKind::Document, 0)?
                .node_key,
        );
    }
    txn.eager_serialize_pages_if_page_boundary_crossed()?;
    txn.commit(None, None, false)?;
    drop(txn);

    let read = resource.begin_read()?;
    for (i, key) in keys.iter().enumerate() {
        let record = read.get_record(*key, IndexKind::Document, 0)?.unwrap();
        assert_eq!(record.payload, (i as u64).to_be_bytes().to_vec());
    }
    assert!(read.get_record(2600, IndexKind::Document, 0)?.is_none());
    Ok(())
}
