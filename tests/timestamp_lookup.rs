#![allow(missing_docs)]

use rastro::{IndexKind, Resource, ResourceConfig};
use tempfile::tempdir;

/// Commits at controlled timestamps, then resolves revisions by wall-clock
/// probes: exact hits, between-commit probes, and both out-of-range sides.
#[test]
fn timestamp_probes_resolve_to_revisions() -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = Resource::create(
        dir.path().join("res"),
        ResourceConfig::new(1, 1).with_backend("file-channel"),
    )?;
    let base = resource.begin_read_at(0)?.commit_timestamp_millis();

    // Revisions 1..=5 at offsets 1_000, 2_000, 3_500, 3_500, 4_000.
    let offsets = [1_000i64, 2_000, 3_500, 3_500, 4_000];
    let mut txn = resource.begin_write()?;
    for (i, offset) in offsets.iter().enumerate() {
        txn.create_record(
            1,
            (i as u64).to_be_bytes().to_vec(),
            None,
            IndexKind::Document,
            0,
        )?;
        txn.commit(None, Some(base + offset), false)?;
    }
    drop(txn);

    // An exact match resolves to a revision carrying that timestamp; equal
    // timestamps may resolve to either revision of the run.
    let exact = resource.begin_read_at_timestamp(base + 3_500)?;
    assert!(exact.revision() == 3 || exact.revision() == 4);
    assert_eq!(exact.commit_timestamp_millis(), base + 3_500);

    // Between two commits, the earlier revision answers.
    let between = resource.begin_read_at_timestamp(base + 3_000)?;
    assert_eq!(between.revision(), 2);

    // Before the first commit there is nothing to read.
    assert!(resource.begin_read_at_timestamp(base - 1).is_err());

    // Past the last commit, the head answers.
    let head = resource.begin_read_at_timestamp(base + 100_000)?;
    assert_eq!(head.revision(), 5);
    Ok(())
}

/// The snapshot a timestamp resolves to serves that revision's data.
#[test]
fn timestamp_snapshot_reads_the_right_data() -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = Resource::create(
        dir.path().join("res"),
        ResourceConfig::new(1, 1).with_backend("file-channel"),
    )?;
    let base = resource.begin_read_at(0)?.commit_timestamp_millis();

    let mut txn = resource.begin_write()?;
    let key = txn
        .create_record(1, b"first".to_vec(), None, IndexKind::Document, 0)?
        .node_key;
    txn.commit(None, Some(base + 10_000), false)?;
    let record = txn.prepare_record_for_modification(key, IndexKind::Document, 0)?;
    record.payload = b"second".to_vec();
    txn.update_record_slot(key, IndexKind::Document, 0)?;
    txn.commit(None, Some(base + 20_000), false)?;
    drop(txn);

    let early = resource.begin_read_at_timestamp(base + 15_000)?;
    assert_eq!(
        early.get_record(key, IndexKind::Document, 0)?.unwrap().payload,
        b"first".to_vec()
    );
    let late = resource.begin_read_at_timestamp(base + 25_000)?;
    assert_eq!(
        late.get_record(key, IndexKind::Document, 0)?.unwrap().payload,
        b"second".to_vec()
    );
    Ok(())
}

/// Commit metadata rides the revision root.
#[test]
fn commit_message_is_recorded() -> rastro::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let resource = Resource::create(
        dir.path().join("res"),
        ResourceConfig::new(1, 1).with_backend("file-channel"),
    )?;
    let mut txn = resource.begin_write()?;
    txn.create_record(1, b"x".to_vec(), None, IndexKind::Document, 0)?;
    txn.commit(Some("nightly checkpoint"), None, false)?;
    drop(txn);

    let read = resource.begin_read()?;
    assert_eq!(read.commit_message(), Some("nightly checkpoint"));
    assert!(read.commit_timestamp_millis() > 0);
    Ok(())
}
