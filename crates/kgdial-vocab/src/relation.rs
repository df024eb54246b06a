//! Relation index: `{_PAD: 0, _NAF: 1}` followed by the relation file, line by
//! line. Derived from the file on every start and never persisted.

use std::fs;
use std::path::Path;

use ahash::AHashMap;

use crate::{BootstrapError, Result, TokenId, DEFAULT_VOCAB, NAF_IDX, PAD_IDX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationIndex {
    names: Vec<String>,
    ids: AHashMap<String, TokenId>,
}

impl RelationIndex {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(BootstrapError::io(path))?;
        let index = Self::from_lines(text.lines());
        tracing::debug!(path = %path.display(), relations = index.len(), "relation index rebuilt");
        Ok(index)
    }

    /// Line `i` of the file gets id `i + 2`, blank lines included. Blank
    /// names are never looked up; a repeated name resolves to its last line.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = Self {
            names: Vec::new(),
            ids: AHashMap::new(),
        };
        index.push(DEFAULT_VOCAB[PAD_IDX as usize]);
        index.push(DEFAULT_VOCAB[NAF_IDX as usize]);
        for line in lines {
            index.push(line.trim());
        }
        index
    }

    fn push(&mut self, name: &str) {
        if !name.is_empty() {
            self.ids.insert(name.to_string(), self.names.len() as TokenId);
        }
        self.names.push(name.to_string());
    }

    pub fn id(&self, name: &str) -> Option<TokenId> {
        self.ids.get(name).copied()
    }

    /// Id of `name`, `NAF_IDX` when unknown.
    pub fn resolve(&self, name: &str) -> TokenId {
        self.id(name).unwrap_or(NAF_IDX)
    }

    pub fn name(&self, id: TokenId) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
