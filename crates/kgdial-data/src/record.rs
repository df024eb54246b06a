//! Raw corpus records and their fixed-shape encoding.
//!
//! One shard line is one [`RawRecord`]. [`RecordEncoder`] resolves it against
//! the id spaces and lays it out as padded rows:
//!
//! | field             | row shape                              |
//! |-------------------|----------------------------------------|
//! | `post`            | `[max_sentence_len]`                   |
//! | `post_length`     | scalar                                 |
//! | `response`        | `[max_sentence_len]`                   |
//! | `response_length` | scalar                                 |
//! | `triple`          | `[max_sentence_len, max_triple_len, 3]`|
//! | `entity`          | `[max_sentence_len, max_triple_len]`   |
//! | `response_triple` | `[max_sentence_len, 3]`                |
//!
//! Position 0 and the position after the last token hold SOS/EOS in the
//! sequences and a NAF entry in the knowledge fields.

use serde::Deserialize;

use kgdial_store::{IntArray, StoreError};
use kgdial_vocab::{
    EntityIndex, IndexTriple, TokenId, TripleCatalog, WordVocabulary, EOS_IDX, NAF_IDX,
    NAF_TRIPLE, SOS_IDX, UNK_IDX,
};

use crate::collate::RowBlock;

/// One conversation turn as stored in a shard.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    pub post: Vec<String>,
    pub response: Vec<String>,
    /// Candidate triple-id lists, referenced 1-based from `post_triples`
    pub all_triples: Vec<Vec<i64>>,
    /// Per post token: index into `all_triples` plus one, 0 for none
    pub post_triples: Vec<i64>,
    /// Per post token: linked knowledge-resource entity ids
    pub all_entities: Vec<Vec<i64>>,
    /// Per response token: triple id, negative for none
    pub response_triples: Vec<i64>,
}

/// A record laid out as flat rows, see the module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub post: Vec<TokenId>,
    pub post_length: TokenId,
    pub response: Vec<TokenId>,
    pub response_length: TokenId,
    pub triple: Vec<TokenId>,
    pub entity: Vec<TokenId>,
    pub response_triple: Vec<TokenId>,
    /// Widest triple or entity list of the record, at least 1
    pub fan_out: usize,
}

/// Stack encoded records into one block of rows.
pub fn stack_records(
    records: &[EncodedRecord],
    max_sentence_len: usize,
    max_triple_len: usize,
) -> Result<RowBlock, StoreError> {
    let n = records.len();
    let (msl, mtl) = (max_sentence_len, max_triple_len);
    RowBlock::try_from_fields(|name| match name {
        "post" => column(records, &[n, msl], |r| r.post.as_slice()),
        "post_length" => column(records, &[n], |r| std::slice::from_ref(&r.post_length)),
        "response" => column(records, &[n, msl], |r| r.response.as_slice()),
        "response_length" => column(records, &[n], |r| std::slice::from_ref(&r.response_length)),
        "triple" => column(records, &[n, msl, mtl, 3], |r| r.triple.as_slice()),
        "entity" => column(records, &[n, msl, mtl], |r| r.entity.as_slice()),
        _ => column(records, &[n, msl, 3], |r| r.response_triple.as_slice()),
    })
}

fn column(
    records: &[EncodedRecord],
    shape: &[usize],
    pick: impl Fn(&EncodedRecord) -> &[TokenId],
) -> Result<IntArray, StoreError> {
    let data = records.iter().flat_map(|r| pick(r).iter().copied()).collect();
    IntArray::from_vec(shape, data)
}

/// Lookup misses recovered during encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupMisses {
    pub tokens: usize,
    pub entities: usize,
    pub triples: usize,
}

impl LookupMisses {
    pub fn total(&self) -> usize {
        self.tokens + self.entities + self.triples
    }
}

pub struct RecordEncoder<'a> {
    words: &'a WordVocabulary,
    entities: &'a EntityIndex,
    catalog: &'a TripleCatalog,
    max_sentence_len: usize,
    max_triple_len: usize,
}

impl<'a> RecordEncoder<'a> {
    pub fn new(
        words: &'a WordVocabulary,
        entities: &'a EntityIndex,
        catalog: &'a TripleCatalog,
        max_sentence_len: usize,
        max_triple_len: usize,
    ) -> Self {
        Self {
            words,
            entities,
            catalog,
            max_sentence_len,
            max_triple_len,
        }
    }

    pub fn max_sentence_len(&self) -> usize {
        self.max_sentence_len
    }

    pub fn max_triple_len(&self) -> usize {
        self.max_triple_len
    }

    /// Encode one record. Structural problems are returned as a message;
    /// unknown ids are replaced and counted in `misses`.
    pub fn encode(&self, record: &RawRecord, misses: &mut LookupMisses) -> Result<EncodedRecord, String> {
        self.check(record)?;
        let (msl, mtl) = (self.max_sentence_len, self.max_triple_len);

        let mut post = vec![0; msl];
        self.fill_sequence(&record.post, &mut post, misses);
        let mut response = vec![0; msl];
        self.fill_sequence(&record.response, &mut response, misses);

        let mut response_triple = vec![0; msl * 3];
        let rows = std::iter::once(NAF_TRIPLE)
            .chain(record.response_triples.iter().map(|&id| self.triple(id, misses)))
            .chain(std::iter::once(NAF_TRIPLE));
        for (slot, triple) in response_triple.chunks_exact_mut(3).zip(rows) {
            slot.copy_from_slice(&triple);
        }

        let mut triple = vec![0; msl * mtl * 3];
        let naf_row = [-1i64];
        let per_token = record.post_triples.iter().map(|&p| {
            if p > 0 {
                record.all_triples[(p - 1) as usize].as_slice()
            } else {
                &naf_row[..]
            }
        });
        let positions = std::iter::once(&naf_row[..])
            .chain(per_token)
            .chain(std::iter::once(&naf_row[..]));
        for (slots, ids) in triple.chunks_exact_mut(mtl * 3).zip(positions) {
            for (slot, &id) in slots.chunks_exact_mut(3).zip(ids) {
                slot.copy_from_slice(&self.triple(id, misses));
            }
        }

        let mut entity = vec![0; msl * mtl];
        let naf_entity = [NAF_IDX];
        let resolved: Vec<Vec<TokenId>> = record
            .all_entities
            .iter()
            .map(|ids| ids.iter().map(|&e| self.entity(e, misses)).collect())
            .collect();
        let positions = std::iter::once(&naf_entity[..])
            .chain(resolved.iter().map(Vec::as_slice))
            .chain(std::iter::once(&naf_entity[..]));
        for (slots, ids) in entity.chunks_exact_mut(mtl).zip(positions) {
            slots[..ids.len()].copy_from_slice(ids);
        }

        let fan_out = record
            .all_triples
            .iter()
            .chain(&record.all_entities)
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(1);

        Ok(EncodedRecord {
            post,
            post_length: (record.post.len() + 2) as TokenId,
            response,
            response_length: (record.response.len() + 2) as TokenId,
            triple,
            entity,
            response_triple,
            fan_out,
        })
    }

    fn check(&self, record: &RawRecord) -> Result<(), String> {
        let max_tokens = self.max_sentence_len - 2;
        for (field, len) in [
            ("post", record.post.len()),
            ("response", record.response.len()),
        ] {
            if len > max_tokens {
                return Err(format!(
                    "{field} has {len} entries, max_sentence_len allows {max_tokens}"
                ));
            }
        }
        if record.post_triples.len() != record.post.len() {
            return Err(format!(
                "post_triples has {} entries for {} post tokens",
                record.post_triples.len(),
                record.post.len()
            ));
        }
        if record.all_entities.len() != record.post.len() {
            return Err(format!(
                "all_entities has {} entries for {} post tokens",
                record.all_entities.len(),
                record.post.len()
            ));
        }
        if record.response_triples.len() != record.response.len() {
            return Err(format!(
                "response_triples has {} entries for {} response tokens",
                record.response_triples.len(),
                record.response.len()
            ));
        }
        if let Some(&bad) = record
            .post_triples
            .iter()
            .find(|&&p| p < 0 || p as usize > record.all_triples.len())
        {
            return Err(format!(
                "post_triples entry {bad} does not index all_triples (len {})",
                record.all_triples.len()
            ));
        }
        for (field, lists) in [("all_triples", &record.all_triples), ("all_entities", &record.all_entities)] {
            if let Some(list) = lists.iter().find(|l| l.len() > self.max_triple_len) {
                return Err(format!(
                    "{field} list of {} exceeds max_triple_len {}",
                    list.len(),
                    self.max_triple_len
                ));
            }
        }
        Ok(())
    }

    fn fill_sequence(&self, tokens: &[String], out: &mut [TokenId], misses: &mut LookupMisses) {
        out[0] = SOS_IDX;
        for (slot, token) in out[1..].iter_mut().zip(tokens) {
            *slot = self.words.get_word_idx(token);
            if *slot == UNK_IDX {
                misses.tokens += 1;
            }
        }
        out[tokens.len() + 1] = EOS_IDX;
    }

    fn triple(&self, id: i64, misses: &mut LookupMisses) -> IndexTriple {
        if id < 0 {
            return NAF_TRIPLE;
        }
        if self.catalog.names(id).is_none() {
            misses.triples += 1;
        }
        self.catalog.resolve(id)
    }

    fn entity(&self, id: i64, misses: &mut LookupMisses) -> TokenId {
        self.entities.get(id).unwrap_or_else(|| {
            misses.entities += 1;
            NAF_IDX
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgdial_vocab::{KnowledgeResource, RelationIndex, Vocabulary, PAD_IDX};
    use std::path::Path;

    struct Fixture {
        vocab: Vocabulary,
        catalog: TripleCatalog,
    }

    fn fixture() -> Fixture {
        let resource = KnowledgeResource::parse(
            "{'dict_csk_entities': {'dog': 0, 'bark': 1},
              'dict_csk_triples': {'dog, CapableOf, bark': 0},
              'dict_csk': {}}",
            Path::new("resource.txt"),
        )
        .unwrap();
        let vocab = Vocabulary::from_parts(["i", "like", "dogs"], &resource.entities);
        let relations = RelationIndex::from_lines(["CapableOf"]);
        let catalog = TripleCatalog::build(&resource, &vocab.words, &relations).unwrap();
        Fixture { vocab, catalog }
    }

    fn record() -> RawRecord {
        serde_json::from_str(
            r#"{"post": ["i", "like", "dogs"], "response": ["woof", "i"],
                "all_triples": [[0, -1]], "post_triples": [0, 0, 1],
                "all_entities": [[], [], [0, 1]], "response_triples": [0, -1]}"#,
        )
        .unwrap()
    }

    #[test]
    fn encodes_sentinels_and_knowledge() {
        let fx = fixture();
        let enc = RecordEncoder::new(&fx.vocab.words, &fx.vocab.entities, &fx.catalog, 8, 3);
        let mut misses = LookupMisses::default();
        let out = enc.encode(&record(), &mut misses).unwrap();

        assert_eq!(out.post, vec![SOS_IDX, 5, 6, 7, EOS_IDX, 0, 0, 0]);
        assert_eq!(out.post_length, 5);
        assert_eq!(out.response[..4], [SOS_IDX, UNK_IDX, 5, EOS_IDX]);
        assert_eq!(out.response_length, 4);
        assert_eq!(misses.tokens, 1);

        let dog = fx.vocab.words.word_id("dog").unwrap();
        let bark = fx.vocab.words.word_id("bark").unwrap();
        let fact = [dog, 2, bark];
        assert_eq!(out.response_triple[..12], [NAF_TRIPLE, fact, NAF_TRIPLE, NAF_TRIPLE].concat());

        // triple[position][slot]
        let at = |p: usize, k: usize| &out.triple[(p * 3 + k) * 3..(p * 3 + k) * 3 + 3];
        assert_eq!(at(0, 0), NAF_TRIPLE);
        assert_eq!(at(1, 0), NAF_TRIPLE);
        assert_eq!(at(1, 1), [PAD_IDX; 3]);
        assert_eq!(at(3, 0), fact);
        assert_eq!(at(3, 1), NAF_TRIPLE);
        assert_eq!(at(4, 0), NAF_TRIPLE);
        assert_eq!(at(5, 0), [PAD_IDX; 3]);

        assert_eq!(out.entity[..3], [NAF_IDX, 0, 0]);
        assert_eq!(out.entity[3..6], [0, 0, 0]);
        assert_eq!(out.entity[9..12], [dog, bark, 0]);
        assert_eq!(out.entity[12..15], [NAF_IDX, 0, 0]);
        assert_eq!(out.fan_out, 2);
    }

    #[test]
    fn unknown_entity_and_triple_become_naf() {
        let fx = fixture();
        let enc = RecordEncoder::new(&fx.vocab.words, &fx.vocab.entities, &fx.catalog, 8, 3);
        let mut rec = record();
        rec.all_entities[0] = vec![42];
        rec.response_triples = vec![99, -1];
        let mut misses = LookupMisses::default();
        let out = enc.encode(&rec, &mut misses).unwrap();
        assert_eq!(out.entity[3], NAF_IDX);
        assert_eq!(out.response_triple[3..6], NAF_TRIPLE);
        assert_eq!((misses.entities, misses.triples), (1, 1));
    }

    #[test]
    fn structural_violations_are_rejected() {
        let fx = fixture();
        let enc = RecordEncoder::new(&fx.vocab.words, &fx.vocab.entities, &fx.catalog, 8, 3);
        let mut misses = LookupMisses::default();

        let mut rec = record();
        rec.post_triples.pop();
        assert!(enc.encode(&rec, &mut misses).is_err());

        let mut rec = record();
        rec.post_triples[2] = 2;
        assert!(enc.encode(&rec, &mut misses).unwrap_err().contains("all_triples"));

        let mut rec = record();
        rec.response_triples.push(0);
        assert!(enc.encode(&rec, &mut misses).is_err());

        let mut rec = record();
        rec.all_triples[0] = vec![0; 4];
        assert!(enc.encode(&rec, &mut misses).unwrap_err().contains("max_triple_len"));

        let mut rec = record();
        rec.all_entities.extend([vec![0], vec![1]]);
        assert!(enc.encode(&rec, &mut misses).unwrap_err().contains("all_entities"));

        let mut rec = record();
        rec.all_entities.pop();
        assert!(enc.encode(&rec, &mut misses).unwrap_err().contains("all_entities"));

        let tight = RecordEncoder::new(&fx.vocab.words, &fx.vocab.entities, &fx.catalog, 4, 3);
        assert!(tight.encode(&record(), &mut misses).unwrap_err().contains("post"));
    }
}
