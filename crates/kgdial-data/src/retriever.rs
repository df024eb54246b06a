//! Knowledge retrieval against an external graph-query service.
//!
//! The service is a collaborator behind [`GraphQueryService`]; the shipped
//! implementation talks to RedisGraph. Every call is a fresh round trip with
//! no caching and no retries.

use kgdial_vocab::{
    EntityIndex, IndexTriple, RelationIndex, TokenId, WordVocabulary, NAF_TRIPLE, UNK_IDX,
};

use crate::RetrievalError;

/// Which end of an edge the queried node sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `(query)-[r]->(neighbor)`
    Outgoing,
    /// `(neighbor)-[r]->(query)`
    Incoming,
}

/// A graph store that can list the edges touching a named node.
pub trait GraphQueryService: Send + Sync {
    /// `(relation, neighbor name)` pairs for every edge of `node` in `direction`.
    fn neighbors(&self, node: &str, direction: Direction) -> Result<Vec<(String, String)>, RetrievalError>;
}

// ============================================================================
// RedisGraph
// ============================================================================

/// `GRAPH.QUERY` client for a RedisGraph database whose nodes carry a `word`
/// property.
pub struct RedisGraphService {
    client: redis::Client,
    graph: String,
}

impl RedisGraphService {
    pub fn open(url: &str, graph: impl Into<String>) -> Result<Self, RetrievalError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            graph: graph.into(),
        })
    }

    pub fn graph(&self) -> &str {
        &self.graph
    }
}

impl std::fmt::Debug for RedisGraphService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisGraphService")
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

/// Cypher text for the edges of `node`.
pub fn neighbor_query(node: &str, direction: Direction) -> String {
    let word = cypher_string(node);
    match direction {
        Direction::Outgoing => {
            format!("MATCH (x)-[r]->(y) WHERE x.word = {word} RETURN type(r), y.word")
        }
        Direction::Incoming => {
            format!("MATCH (x)-[r]->(y) WHERE y.word = {word} RETURN type(r), x.word")
        }
    }
}

/// Single-quoted Cypher string literal.
fn cypher_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl GraphQueryService for RedisGraphService {
    fn neighbors(&self, node: &str, direction: Direction) -> Result<Vec<(String, String)>, RetrievalError> {
        let mut con = self.client.get_connection()?;
        // reply: [header, rows, statistics]
        let (_header, rows, _stats): (redis::Value, Vec<Vec<String>>, redis::Value) =
            redis::cmd("GRAPH.QUERY")
                .arg(&self.graph)
                .arg(neighbor_query(node, direction))
                .query(&mut con)?;
        rows.into_iter()
            .map(|row| match <[String; 2]>::try_from(row) {
                Ok([relation, neighbor]) => Ok((relation, neighbor)),
                Err(row) => Err(RetrievalError::Reply(format!(
                    "expected (relation, word) rows, got {} columns",
                    row.len()
                ))),
            })
            .collect()
    }
}

// ============================================================================
// Retriever
// ============================================================================

/// Resolves graph neighbors of entity words into index triples.
pub struct KnowledgeRetriever<'a, G: GraphQueryService + ?Sized> {
    service: &'a G,
    words: &'a WordVocabulary,
    entities: &'a EntityIndex,
    relations: &'a RelationIndex,
}

impl<'a, G: GraphQueryService + ?Sized> KnowledgeRetriever<'a, G> {
    pub fn new(
        service: &'a G,
        words: &'a WordVocabulary,
        entities: &'a EntityIndex,
        relations: &'a RelationIndex,
    ) -> Self {
        Self {
            service,
            words,
            entities,
            relations,
        }
    }

    /// Facts around `word`: outgoing edges as `[word, rel, neighbor]`, then
    /// incoming edges as `[neighbor, rel, word]`.
    ///
    /// A word that is not a knowledge entity gives `[NAF_TRIPLE]` without a
    /// query; an entity without edges gives an empty list.
    pub fn retrieve(&self, word: TokenId) -> Result<Vec<IndexTriple>, RetrievalError> {
        let name = match self.words.word(word) {
            Some(name) if self.entities.contains_word(word) => name,
            _ => return Ok(vec![NAF_TRIPLE]),
        };

        let outgoing = self.service.neighbors(name, Direction::Outgoing)?;
        let incoming = self.service.neighbors(name, Direction::Incoming)?;

        let mut triples = Vec::with_capacity(outgoing.len() + incoming.len());
        for (relation, neighbor) in &outgoing {
            triples.push([word, self.relations.resolve(relation), self.neighbor(neighbor)]);
        }
        for (relation, neighbor) in &incoming {
            triples.push([self.neighbor(neighbor), self.relations.resolve(relation), word]);
        }
        tracing::debug!(word = name, facts = triples.len(), "retrieved graph neighbors");
        Ok(triples)
    }

    /// `retrieve` for every word, in order. Stops at the first failure.
    pub fn retrieve_many(&self, words: &[TokenId]) -> Result<Vec<Vec<IndexTriple>>, RetrievalError> {
        words.iter().map(|&w| self.retrieve(w)).collect()
    }

    fn neighbor(&self, name: &str) -> TokenId {
        self.words.word_id(name).unwrap_or(UNK_IDX)
    }
}
