//! Word vocabulary and entity index.
//!
//! ## Id layout
//!
//! ```text
//! 0..5                         _PAD _NAF _UNK _SOS _EOS
//! 5..5+n_glove_vocab           pretrained tokens, file order
//! 5+n_glove_vocab..            entity names not already present, resource order
//! ```
//!
//! Ids at or past the glove bound belong to entities only; they have no
//! trained embedding, so `get_word_idx` maps them to `UNK_IDX`.
//!
//! ## Persistence
//!
//! `KGDV` magic, u32 LE format version, then a bincode payload. The file is
//! written once and reused on every later start so ids stay stable across
//! dataset rebuilds.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::{BootstrapError, Result, TokenId, DEFAULT_VOCAB, NAF_IDX, UNK_IDX};

const VOCAB_MAGIC: &[u8; 4] = b"KGDV";
const VOCAB_FORMAT_VERSION: u32 = 1;

// ============================================================================
// WordVocabulary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordVocabulary {
    words: Vec<String>,
    index: AHashMap<String, TokenId>,
    n_glove_vocab: usize,
}

impl WordVocabulary {
    fn with_specials() -> Self {
        let mut vocab = Self {
            words: Vec::new(),
            index: AHashMap::new(),
            n_glove_vocab: 0,
        };
        for special in DEFAULT_VOCAB {
            vocab.intern(special);
        }
        vocab
    }

    fn from_words(words: Vec<String>, n_glove_vocab: usize) -> Result<Self, String> {
        let mut index = AHashMap::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            if index.insert(word.clone(), id as TokenId).is_some() {
                return Err(format!("word {word:?} appears twice"));
            }
        }
        if words.len() < DEFAULT_VOCAB.len() + n_glove_vocab {
            return Err(format!(
                "{} words cannot hold {} pretrained tokens",
                words.len(),
                n_glove_vocab
            ));
        }
        if words.iter().zip(DEFAULT_VOCAB).any(|(w, s)| w != s) {
            return Err("special tokens are not at ids 0..5".to_string());
        }
        Ok(Self {
            words,
            index,
            n_glove_vocab,
        })
    }

    /// Returns the id of `word`, allocating the next id if it is new.
    fn intern(&mut self, word: &str) -> TokenId {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.words.len() as TokenId;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
        id
    }

    /// Id of a corpus token: `UNK_IDX` when absent or past the glove bound.
    pub fn get_word_idx(&self, token: &str) -> TokenId {
        match self.index.get(token) {
            Some(&id) if (id as usize) < self.glove_bound() => id,
            _ => UNK_IDX,
        }
    }

    /// Raw lookup without the glove bound.
    pub fn word_id(&self, token: &str) -> Option<TokenId> {
        self.index.get(token).copied()
    }

    pub fn word(&self, id: TokenId) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.words.get(i))
            .map(String::as_str)
    }

    /// Number of pretrained tokens.
    pub fn n_glove_vocab(&self) -> usize {
        self.n_glove_vocab
    }

    /// First id that has no pretrained embedding.
    pub fn glove_bound(&self) -> usize {
        self.n_glove_vocab + DEFAULT_VOCAB.len()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ============================================================================
// EntityIndex
// ============================================================================

/// Knowledge-resource entity id -> word id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityIndex {
    map: AHashMap<u32, TokenId>,
    words: AHashSet<TokenId>,
}

impl EntityIndex {
    fn insert(&mut self, entity: u32, word: TokenId) {
        self.map.insert(entity, word);
        self.words.insert(word);
    }

    pub fn get(&self, entity: i64) -> Option<TokenId> {
        u32::try_from(entity)
            .ok()
            .and_then(|e| self.map.get(&e))
            .copied()
    }

    /// Word id of `entity`, `NAF_IDX` when unknown.
    pub fn resolve(&self, entity: i64) -> TokenId {
        self.get(entity).unwrap_or(NAF_IDX)
    }

    /// Whether `word` is the word id of some knowledge entity.
    pub fn contains_word(&self, word: TokenId) -> bool {
        self.words.contains(&word)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// Vocabulary
// ============================================================================

#[derive(Serialize, Deserialize)]
struct VocabFile {
    words: Vec<String>,
    entity_to_word: Vec<(u32, TokenId)>,
    n_glove_vocab: u64,
}

/// Words and entities, built and persisted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    pub words: WordVocabulary,
    pub entities: EntityIndex,
}

impl Vocabulary {
    /// Build from in-memory pretrained tokens and resource entities.
    pub fn from_parts<'a>(
        pretrained: impl IntoIterator<Item = &'a str>,
        entities: &[(String, u32)],
    ) -> Self {
        let mut words = WordVocabulary::with_specials();
        for token in pretrained {
            words.intern(token);
        }
        words.n_glove_vocab = words.len() - DEFAULT_VOCAB.len();

        let mut index = EntityIndex::default();
        for (name, entity) in entities {
            let id = words.intern(name);
            index.insert(*entity, id);
        }
        Self {
            words,
            entities: index,
        }
    }

    /// Build from the first `n_glove_vocab` lines of a pretrained embedding
    /// file (token = first whitespace-separated field) and resource entities.
    pub fn build(glove_path: &Path, n_glove_vocab: usize, entities: &[(String, u32)]) -> Result<Self> {
        let file = File::open(glove_path).map_err(BootstrapError::io(glove_path))?;
        let mut tokens = Vec::with_capacity(n_glove_vocab.min(1 << 20));
        for (n, line) in BufReader::new(file).lines().take(n_glove_vocab).enumerate() {
            let line = line.map_err(BootstrapError::io(glove_path))?;
            let token = line.split_whitespace().next().ok_or_else(|| {
                BootstrapError::schema(glove_path, format!("line {} has no token", n + 1))
            })?;
            tokens.push(token.to_string());
        }

        let vocab = Self::from_parts(tokens.iter().map(String::as_str), entities);
        tracing::info!(
            words = vocab.words.len(),
            pretrained = vocab.words.n_glove_vocab(),
            entities = vocab.entities.len(),
            "vocabulary built"
        );
        Ok(vocab)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut entity_to_word: Vec<(u32, TokenId)> =
            self.entities.map.iter().map(|(&e, &w)| (e, w)).collect();
        entity_to_word.sort_unstable();
        let payload = bincode::serialize(&VocabFile {
            words: self.words.words.clone(),
            entity_to_word,
            n_glove_vocab: self.words.n_glove_vocab as u64,
        })?;

        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(VOCAB_MAGIC);
        out.extend_from_slice(&VOCAB_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < 8 || &bytes[0..4] != VOCAB_MAGIC {
            return Err("bad magic".to_string());
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != VOCAB_FORMAT_VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let file: VocabFile = bincode::deserialize(&bytes[8..]).map_err(|e| e.to_string())?;

        let words = WordVocabulary::from_words(file.words, file.n_glove_vocab as usize)?;
        let mut entities = EntityIndex::default();
        for (entity, word) in file.entity_to_word {
            if words.word(word).is_none() {
                return Err(format!("entity {entity} points at missing word {word}"));
            }
            entities.insert(entity, word);
        }
        Ok(Self { words, entities })
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes().map_err(|e| BootstrapError::CorruptVocabulary {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(BootstrapError::io(parent))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(BootstrapError::io(&tmp))?;
        fs::rename(&tmp, path).map_err(BootstrapError::io(path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(BootstrapError::io(path))?;
        Self::from_bytes(&bytes).map_err(|message| BootstrapError::CorruptVocabulary {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Load `path`, or build with `build` and persist when it does not exist.
    ///
    /// A present but unreadable file is an error, never a rebuild.
    pub fn load_or_build(path: &Path, build: impl FnOnce() -> Result<Self>) -> Result<Self> {
        if path.exists() {
            let vocab = Self::load(path)?;
            tracing::debug!(path = %path.display(), words = vocab.words.len(), "vocabulary loaded");
            return Ok(vocab);
        }
        let vocab = build()?;
        vocab.save(path)?;
        tracing::info!(path = %path.display(), "vocabulary saved");
        Ok(vocab)
    }
}
