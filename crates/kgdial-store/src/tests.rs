//! End-to-end tests for the chunked array store

use super::*;
use rayon::prelude::*;
use tempfile::tempdir;

fn seq(shape: &[usize], start: i32) -> IntArray {
    let n: usize = shape.iter().product();
    IntArray::from_vec(shape, (start..start + n as i32).collect()).unwrap()
}

#[test]
fn test_write_then_read_across_chunk_boundaries() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("trainset.kgd");
    let store = ArrayStore::create(
        &root,
        4,
        &[ArraySpec::new("post", &[12, 3]), ArraySpec::new("len", &[12])],
    )
    .unwrap();

    // rows 3..9 straddle chunks 0, 1 and 2
    let block = seq(&[6, 3], 100);
    store.write_rows("post", 3, &block).unwrap();
    store.write_rows("len", 3, &seq(&[6], 1)).unwrap();

    let back = store.read_rows("post", 3, 6).unwrap();
    assert_eq!(back, block);
    assert_eq!(store.read_row("len", 8).unwrap().data(), &[6]);

    // untouched rows are zero
    assert_eq!(store.read_row("post", 0).unwrap().data(), &[0, 0, 0]);
}

#[test]
fn test_concurrent_disjoint_writers() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let store = ArrayStore::create(&root, 3, &[ArraySpec::new("x", &[20, 2])]).unwrap();

    // shard sizes deliberately not aligned to the chunk size
    let shards: Vec<(usize, usize)> = vec![(0, 5), (5, 4), (9, 7), (16, 4)];
    shards
        .par_iter()
        .try_for_each(|&(offset, rows)| {
            let values = IntArray::from_vec(&[rows, 2], vec![offset as i32; rows * 2]).unwrap();
            store.write_rows("x", offset, &values)
        })
        .unwrap();

    let all = store.read_rows("x", 0, 20).unwrap();
    for &(offset, rows) in &shards {
        for r in offset..offset + rows {
            assert_eq!(all.row(r), &[offset as i32, offset as i32], "row {r}");
        }
    }
}

#[test]
fn test_resize_trims_rows_and_inner_dims() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let mut store =
        ArrayStore::create(&root, 2, &[ArraySpec::new("triple", &[8, 4, 3])]).unwrap();
    store.write_rows("triple", 0, &seq(&[5, 4, 3], 0)).unwrap();

    store.resize("triple", &[5, 2, 3]).unwrap();
    assert_eq!(store.shape("triple").unwrap(), &[5, 2, 3]);

    // row 4 originally held 48..60; its first two 3-vectors survive
    let row = store.read_row("triple", 4).unwrap();
    assert_eq!(row.data(), &[48, 49, 50, 51, 52, 53]);

    // chunk 3 (rows 6..8) is gone
    assert!(!root.join("triple").join("c3.bin").exists());
    assert!(store.read_row("triple", 5).is_err());
}

#[test]
fn test_resize_refuses_to_grow() {
    let dir = tempdir().unwrap();
    let mut store =
        ArrayStore::create(&dir.path().join("s"), 2, &[ArraySpec::new("a", &[4, 2])]).unwrap();
    assert!(store.resize("a", &[4, 3]).is_err());
    assert!(store.resize("a", &[5, 2]).is_err());
    assert!(store.resize("a", &[4]).is_err());
}

#[test]
fn test_validate_requires_completion() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let mut store = ArrayStore::create(&root, 2, &[ArraySpec::new("a", &[3, 1])]).unwrap();
    assert!(matches!(store.validate(), Err(StoreError::Incomplete(_))));

    store.mark_complete().unwrap();
    store.validate().unwrap();

    let reopened = ArrayStore::open(&root).unwrap();
    assert_eq!(reopened.state(), StoreState::Complete);
    reopened.validate().unwrap();
}

#[test]
fn test_validate_detects_truncated_chunk_and_row_mismatch() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let mut store = ArrayStore::create(
        &root,
        2,
        &[ArraySpec::new("a", &[4, 2]), ArraySpec::new("b", &[4])],
    )
    .unwrap();
    store.mark_complete().unwrap();

    std::fs::write(root.join("a").join("c1.bin"), [0u8; 3]).unwrap();
    assert!(ArrayStore::open(&root).unwrap().validate().is_err());

    let mut store = ArrayStore::open(&root).unwrap();
    std::fs::write(root.join("a").join("c1.bin"), [0u8; 16]).unwrap();
    store.resize("b", &[3]).unwrap();
    assert!(matches!(store.validate(), Err(StoreError::Shape { .. })));
}

#[test]
fn test_gather_rows_in_given_order() {
    let dir = tempdir().unwrap();
    let store = ArrayStore::create(&dir.path().join("s"), 2, &[ArraySpec::new("a", &[5, 2])]).unwrap();
    store.write_rows("a", 0, &seq(&[5, 2], 0)).unwrap();

    let picked = store.read_rows_at("a", &[4, 1, 1]).unwrap();
    assert_eq!(picked.data(), &[8, 9, 2, 3, 2, 3]);
    assert!(store.read_rows_at("a", &[5]).is_err());
}

#[test]
fn test_create_rejects_existing_dir_and_zero_dims() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        ArrayStore::create(dir.path(), 2, &[ArraySpec::new("a", &[1])]),
        Err(StoreError::AlreadyExists(_))
    ));
    assert!(ArrayStore::create(&dir.path().join("z"), 2, &[ArraySpec::new("a", &[2, 0])]).is_err());
    assert!(ArrayStore::create(&dir.path().join("c"), 0, &[]).is_err());
}

#[test]
fn test_open_rejects_unknown_version() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("s");
    ArrayStore::create(&root, 2, &[ArraySpec::new("a", &[1])]).unwrap();
    let text = std::fs::read_to_string(root.join(MANIFEST_FILE)).unwrap();
    std::fs::write(
        root.join(MANIFEST_FILE),
        text.replace("\"version\": 1", "\"version\": 99"),
    )
    .unwrap();
    assert!(matches!(
        ArrayStore::open(&root),
        Err(StoreError::Manifest { .. })
    ));
}
