//! Triple catalog and knowledge dict, both resolved into index triples at load.

use ahash::AHashMap;

use crate::relation::RelationIndex;
use crate::resource::{split_triple, KnowledgeResource, ADJACENCY_TABLE, TRIPLES_TABLE};
use crate::vocab::WordVocabulary;
use crate::{BootstrapError, IndexTriple, Result, TokenId, NAF_TRIPLE, UNK_IDX};

static NAF_ONLY: [IndexTriple; 1] = [NAF_TRIPLE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleNames {
    pub head: String,
    pub relation: String,
    pub tail: String,
}

/// Counts lookup misses while resolving names.
#[derive(Debug, Default)]
struct Misses {
    words: usize,
    relations: usize,
}

impl Misses {
    fn resolve(
        &mut self,
        (head, relation, tail): (&str, &str, &str),
        words: &WordVocabulary,
        relations: &RelationIndex,
    ) -> IndexTriple {
        let mut word = |name: &str| {
            words.word_id(name).unwrap_or_else(|| {
                self.words += 1;
                UNK_IDX
            })
        };
        let h = word(head);
        let t = word(tail);
        let r = relations.id(relation).unwrap_or_else(|| {
            self.relations += 1;
            relations.resolve(relation)
        });
        [h, r, t]
    }

    fn report(&self, table: &str) {
        if self.words > 0 || self.relations > 0 {
            tracing::warn!(
                table,
                unknown_words = self.words,
                unknown_relations = self.relations,
                "unresolved names replaced by UNK/NAF"
            );
        }
    }
}

// ============================================================================
// TripleCatalog
// ============================================================================

/// Numeric triple id -> names and resolved index triple.
#[derive(Debug, Clone, Default)]
pub struct TripleCatalog {
    entries: AHashMap<i64, (TripleNames, IndexTriple)>,
}

impl TripleCatalog {
    pub fn build(
        resource: &KnowledgeResource,
        words: &WordVocabulary,
        relations: &RelationIndex,
    ) -> Result<Self> {
        let mut misses = Misses::default();
        let mut entries = AHashMap::with_capacity(resource.triples.len());
        for (text, id) in &resource.triples {
            let parts = split_triple(text).ok_or_else(|| {
                BootstrapError::schema(
                    &resource.path,
                    format!("{TRIPLES_TABLE} key {text:?} is not \"head, relation, tail\""),
                )
            })?;
            let index = misses.resolve(parts, words, relations);
            let names = TripleNames {
                head: parts.0.to_string(),
                relation: parts.1.to_string(),
                tail: parts.2.to_string(),
            };
            entries.insert(*id, (names, index));
        }
        misses.report(TRIPLES_TABLE);
        Ok(Self { entries })
    }

    /// Index triple for a numeric id; negative or unknown ids give `NAF_TRIPLE`.
    pub fn resolve(&self, id: i64) -> IndexTriple {
        self.entries.get(&id).map_or(NAF_TRIPLE, |(_, index)| *index)
    }

    pub fn names(&self, id: i64) -> Option<&TripleNames> {
        self.entries.get(&id).map(|(names, _)| names)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// KnowledgeDict
// ============================================================================

/// Entity word id -> known facts about it.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeDict {
    adjacency: AHashMap<TokenId, Vec<IndexTriple>>,
}

impl KnowledgeDict {
    pub fn build(
        resource: &KnowledgeResource,
        words: &WordVocabulary,
        relations: &RelationIndex,
    ) -> Result<Self> {
        let mut misses = Misses::default();
        let mut unknown_entities = 0usize;
        let mut adjacency = AHashMap::with_capacity(resource.adjacency.len());
        for (entity, facts) in &resource.adjacency {
            let mut triples = Vec::with_capacity(facts.len());
            for fact in facts {
                let parts = split_triple(fact).ok_or_else(|| {
                    BootstrapError::schema(
                        &resource.path,
                        format!("{ADJACENCY_TABLE}[{entity:?}] holds malformed triple {fact:?}"),
                    )
                })?;
                triples.push(misses.resolve(parts, words, relations));
            }
            let Some(key) = words.word_id(entity) else {
                unknown_entities += 1;
                continue;
            };
            if !triples.is_empty() {
                adjacency.insert(key, triples);
            }
        }
        misses.report(ADJACENCY_TABLE);
        if unknown_entities > 0 {
            tracing::warn!(unknown_entities, "adjacency entries for entities missing from the vocabulary dropped");
        }
        Ok(Self { adjacency })
    }

    /// Facts about `entity`, `[NAF_TRIPLE]` when none are recorded.
    pub fn get(&self, entity: TokenId) -> &[IndexTriple] {
        self.adjacency
            .get(&entity)
            .map_or(&NAF_ONLY[..], Vec::as_slice)
    }

    pub fn contains(&self, entity: TokenId) -> bool {
        self.adjacency.contains_key(&entity)
    }

    /// Number of entities with at least one fact.
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Vocabulary;
    use crate::NAF_IDX;
    use std::path::Path;

    fn fixture() -> (KnowledgeResource, Vocabulary, RelationIndex) {
        let resource = KnowledgeResource::parse(
            r#"{
                'dict_csk_entities': {'dog': 0, 'bark': 1, 'cat': 2},
                'dict_csk_triples': {
                    'dog, CapableOf, bark': 0,
                    'cat, Chases, mouse': 1,
                },
                'dict_csk': {
                    'dog': ['dog, CapableOf, bark', 'cat, IsA, dog'],
                    'cat': [],
                    'ghost': ['ghost, IsA, dog'],
                },
            }"#,
            Path::new("resource.txt"),
        )
        .unwrap();
        let vocab = Vocabulary::from_parts(["the", "a"], &resource.entities);
        let relations = RelationIndex::from_lines(["IsA", "CapableOf"]);
        (resource, vocab, relations)
    }

    #[test]
    fn catalog_resolves_ids() {
        let (resource, vocab, relations) = fixture();
        let catalog = TripleCatalog::build(&resource, &vocab.words, &relations).unwrap();
        let dog = vocab.words.word_id("dog").unwrap();
        let bark = vocab.words.word_id("bark").unwrap();
        let cat = vocab.words.word_id("cat").unwrap();

        assert_eq!(catalog.resolve(0), [dog, 3, bark]);
        // unknown relation and unknown tail word
        assert_eq!(catalog.resolve(1), [cat, NAF_IDX, UNK_IDX]);
        assert_eq!(catalog.resolve(-1), NAF_TRIPLE);
        assert_eq!(catalog.resolve(42), NAF_TRIPLE);
        assert_eq!(catalog.names(1).unwrap().tail, "mouse");
    }

    #[test]
    fn knowledge_dict_defaults_to_naf() {
        let (resource, vocab, relations) = fixture();
        let kd = KnowledgeDict::build(&resource, &vocab.words, &relations).unwrap();
        let dog = vocab.words.word_id("dog").unwrap();
        let cat = vocab.words.word_id("cat").unwrap();

        assert_eq!(kd.get(dog).len(), 2);
        assert_eq!(kd.get(dog)[1], [cat, 2, dog]);
        assert_eq!(kd.get(cat), &[NAF_TRIPLE]);
        assert_eq!(kd.get(9999), &[NAF_TRIPLE]);
        assert_eq!(kd.len(), 1);
    }

    #[test]
    fn malformed_triple_string_is_fatal() {
        let resource = KnowledgeResource::parse(
            "{'dict_csk_entities': {}, 'dict_csk_triples': {'a, b': 0}, 'dict_csk': {}}",
            Path::new("r.txt"),
        )
        .unwrap();
        let vocab = Vocabulary::from_parts([], &[]);
        let relations = RelationIndex::from_lines([]);
        assert!(matches!(
            TripleCatalog::build(&resource, &vocab.words, &relations),
            Err(BootstrapError::Schema { .. })
        ));
    }
}
