//! Integration tests for the complete kgdial pipeline
//!
//! These tests drive a small on-disk corpus through every stage:
//! - resource + glove → vocabulary (built once, then reused)
//! - shards → packer → array store
//! - sampler → fetch → collate
//! - graph-query service → retriever
//!
//! Run with: cargo test --test integration_tests

use std::collections::{BTreeSet, HashMap};
use std::fs;

use serde_json::json;
use tempfile::TempDir;

use kgdial_data::{
    collate, BatchLoader, DataError, DatasetConfig, DialDataset, Direction, DistributedSampler,
    GraphQueryService, LoaderOptions, RetrievalError, NAF_TRIPLE, PAD_IDX,
};
use kgdial_store::ArrayStore;
use kgdial_vocab::Vocabulary;

// ============================================================================
// Fixture corpus
// ============================================================================

const WORDS: [&str; 3] = ["i", "like", "dogs"];

fn corpus() -> (TempDir, DatasetConfig) {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    fs::write(
        data.join("glove.840B.300d.txt"),
        "i 0.1 0.2\nlike 0.2 0.3\ndogs 0.3 0.4\nthe 0.4 0.5\ncats 0.5 0.6\n",
    )
    .unwrap();
    fs::write(
        data.join("resource.txt"),
        "{'csk_entities': ['dog', 'bark', 'cat'], \
          'dict_csk_entities': {'dog': 0, 'bark': 1, 'cat': 2}, \
          'dict_csk_triples': {'dog, CapableOf, bark': 0, 'cat, IsA, pet': 1}, \
          'dict_csk': {'dog': ['dog, CapableOf, bark'], 'cat': ['cat, IsA, pet']}}",
    )
    .unwrap();
    fs::write(data.join("relation.txt"), "CapableOf\nIsA\n").unwrap();
    for split in ["train", "valid", "test"] {
        fs::create_dir(data.join(format!("{split}set_pieces"))).unwrap();
    }

    let config = DatasetConfig {
        data_dir: data.to_path_buf(),
        max_sentence_len: 12,
        max_triple_len: 4,
        chunk_rows: 2,
        batch_access: 2,
        num_workers: Some(3),
        ..Default::default()
    };
    (dir, config)
}

/// `len` post tokens; the last one links to triples 0 and 1.
fn record(len: usize) -> String {
    let post: Vec<&str> = (0..len).map(|i| WORDS[i % 3]).collect();
    let mut post_triples = vec![0; len];
    post_triples[len - 1] = 1;
    let mut all_entities = vec![json!([]); len];
    all_entities[len - 1] = json!([0, 1]);
    json!({
        "post": post,
        "response": ["the", "cats"],
        "all_triples": [[0, 1]],
        "post_triples": post_triples,
        "all_entities": all_entities,
        "response_triples": [-1, 1],
    })
    .to_string()
}

fn write_shard(config: &DatasetConfig, split: &str, name: &str, lens: &[usize]) {
    let body: String = lens.iter().map(|&l| record(l) + "\n").collect();
    fs::write(config.shard_dir(split).join(name), body).unwrap();
}

/// Three shards of 4, 4 and 3 records; longest post has 6 tokens.
fn packed_train() -> (TempDir, DatasetConfig) {
    let (dir, config) = corpus();
    write_shard(&config, "train", "a.jsonl", &[1, 2, 3, 4]);
    write_shard(&config, "train", "b.jsonl", &[2, 2, 5, 1]);
    write_shard(&config, "train", "c.jsonl", &[3, 6, 2]);
    (dir, config)
}

// ============================================================================
// Packing
// ============================================================================

#[test]
fn test_pack_trims_store_to_observed_maxima() {
    let (_dir, config) = packed_train();
    let ds = DialDataset::open(&config, "train").unwrap();

    let store = ds.store();
    assert_eq!(store.rows(), 11);
    assert_eq!(store.shape("post").unwrap(), &[11, 8]);
    assert_eq!(store.shape("response").unwrap(), &[11, 4]);
    assert_eq!(store.shape("triple").unwrap(), &[11, 8, 2, 3]);
    assert_eq!(store.shape("entity").unwrap(), &[11, 8, 2]);
    assert_eq!(store.shape("response_triple").unwrap(), &[11, 4, 3]);

    // shard order is filename order, records keep their line order
    let lengths = store.read_rows("post_length", 0, 11).unwrap();
    assert_eq!(lengths.data(), &[3, 4, 5, 6, 4, 4, 7, 3, 5, 8, 4]);
}

#[test]
fn test_reopened_store_matches_and_survives_missing_shards() {
    let (_dir, config) = packed_train();
    let first = DialDataset::open(&config, "train").unwrap();
    let before = first.fetch_rows(&[9, 0]).unwrap();
    drop(first);

    fs::remove_dir_all(config.shard_dir("train")).unwrap();
    let reopened = ArrayStore::open(&config.store_dir("train")).unwrap();
    reopened.validate().unwrap();

    let ds = DialDataset::open(&config, "train").unwrap();
    let after = ds.fetch_rows(&[9, 0]).unwrap();
    for ((name, a), (_, b)) in before.fields().into_iter().zip(after.fields()) {
        assert_eq!(a, b, "field {name} changed across reopen");
    }
}

#[test]
fn test_vocabulary_is_built_once_and_reused() {
    let (_dir, config) = packed_train();
    write_shard(&config, "valid", "a.jsonl", &[2]);
    let ds = DialDataset::open(&config, "train").unwrap();
    let bytes = fs::read(config.vocab_path()).unwrap();
    assert_eq!(Vocabulary::from_bytes(&bytes).unwrap().words.len(), ds.vocabulary().words.len());

    // glove is only needed to build
    fs::remove_file(config.glove_path()).unwrap();
    let valid = DialDataset::open(&config, "valid").unwrap();
    assert_eq!(valid.get_word_idx("cats"), ds.get_word_idx("cats"));
    assert_eq!(fs::read(config.vocab_path()).unwrap(), bytes);
}

#[test]
fn test_empty_split_is_an_error() {
    let (_dir, config) = corpus();
    fs::write(config.shard_dir("test").join("a.jsonl"), "\n\n").unwrap();
    let err = DialDataset::open(&config, "test").unwrap_err();
    assert!(matches!(err, DataError::Packing(_)), "{err}");
    assert!(!config.store_dir("test").exists());
}

// ============================================================================
// Sampling and collation
// ============================================================================

#[test]
fn test_replicas_cover_every_row_each_epoch() {
    let (_dir, config) = packed_train();
    let ds = DialDataset::open(&config, "train").unwrap();

    for epoch in 0..3 {
        let mut seen = BTreeSet::new();
        let mut per_replica = Vec::new();
        for rank in 0..2 {
            let sampler = DistributedSampler::new(ds.len(), 2, rank, 2, true).unwrap();
            let indices = sampler.indices(epoch);
            per_replica.push(indices.len());
            seen.extend(indices);
        }
        assert_eq!(per_replica, vec![6, 6]);
        assert_eq!(seen, (0..11).collect::<BTreeSet<_>>());
    }
}

#[test]
fn test_collated_batches_are_sorted_and_trimmed() {
    let (_dir, config) = packed_train();
    let ds = DialDataset::open(&config, "train").unwrap();

    let sampler = DistributedSampler::new(ds.len(), 1, 0, 2, true).unwrap();
    let blocks = sampler.blocks(7);
    let fetched = blocks[..3]
        .iter()
        .map(|rows| ds.fetch_rows(rows).unwrap())
        .collect();
    let batch = collate(fetched).unwrap();

    assert_eq!(batch.len(), 6);
    let lengths = batch.post_length.data();
    assert!(lengths.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(batch.post.shape(), &[6, lengths[0] as usize]);
    assert_eq!(batch.triple.shape(), &[6, lengths[0] as usize, 2, 3]);
    for row in 0..batch.len() {
        let len = lengths[row] as usize;
        assert!(batch.post.row(row)[len..].iter().all(|&t| t == PAD_IDX));
    }
}

#[test]
fn test_loader_epoch_serves_every_row() {
    let (_dir, config) = packed_train();
    let ds = DialDataset::open(&config, "train").unwrap();
    let options = LoaderOptions {
        batch_size: 4,
        shuffle: true,
        world_size: 1,
        rank: 0,
    };
    let loader = BatchLoader::new(&ds, options).unwrap();
    assert_eq!(loader.batches_per_epoch(), 3);

    let mut rows = 0;
    let mut lengths = BTreeSet::new();
    for batch in loader.epoch(1) {
        let batch = batch.unwrap();
        rows += batch.len();
        lengths.extend(batch.post_length.data().iter().copied());
    }
    // 11 rows padded to 12
    assert_eq!(rows, 12);
    assert_eq!(lengths, BTreeSet::from([3, 4, 5, 6, 7, 8]));
}

// ============================================================================
// Retrieval
// ============================================================================

#[derive(Default)]
struct StaticGraph {
    edges: HashMap<(String, bool), Vec<(String, String)>>,
}

impl StaticGraph {
    fn with(mut self, head: &str, relation: &str, tail: &str) -> Self {
        self.edges
            .entry((head.into(), true))
            .or_default()
            .push((relation.into(), tail.into()));
        self.edges
            .entry((tail.into(), false))
            .or_default()
            .push((relation.into(), head.into()));
        self
    }
}

impl GraphQueryService for StaticGraph {
    fn neighbors(
        &self,
        node: &str,
        direction: Direction,
    ) -> Result<Vec<(String, String)>, RetrievalError> {
        let key = (node.to_string(), direction == Direction::Outgoing);
        Ok(self.edges.get(&key).cloned().unwrap_or_default())
    }
}

#[test]
fn test_retriever_maps_graph_neighbors_into_corpus_ids() {
    let (_dir, config) = packed_train();
    let ds = DialDataset::open(&config, "train").unwrap();
    let graph = StaticGraph::default()
        .with("dog", "CapableOf", "bark")
        .with("cat", "IsA", "dog");
    let retriever = ds.retriever(&graph);

    let id = |w: &str| ds.vocabulary().words.word_id(w).unwrap();
    let capable = ds.relations().id("CapableOf").unwrap();
    let is_a = ds.relations().id("IsA").unwrap();

    let facts = retriever.retrieve_many(&[id("dog"), id("the")]).unwrap();
    assert_eq!(
        facts,
        vec![
            vec![[id("dog"), capable, id("bark")], [id("cat"), is_a, id("dog")]],
            vec![NAF_TRIPLE],
        ]
    );
}
