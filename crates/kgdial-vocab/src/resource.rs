//! The knowledge resource file.
//!
//! One Python-literal dict holding (among tables we ignore):
//!
//! - `dict_csk_entities`: entity name -> entity id
//! - `dict_csk_triples`: `"head, relation, tail"` -> triple id
//! - `dict_csk`: entity name -> list of `"head, relation, tail"` strings

use std::fs;
use std::path::{Path, PathBuf};

use crate::literal::{parse_literal, Literal};
use crate::{BootstrapError, Result};

pub const ENTITIES_TABLE: &str = "dict_csk_entities";
pub const TRIPLES_TABLE: &str = "dict_csk_triples";
pub const ADJACENCY_TABLE: &str = "dict_csk";

/// The three tables of a knowledge resource, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeResource {
    pub path: PathBuf,
    pub entities: Vec<(String, u32)>,
    pub triples: Vec<(String, i64)>,
    pub adjacency: Vec<(String, Vec<String>)>,
}

impl KnowledgeResource {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(BootstrapError::io(path))?;
        Self::parse(&text, path)
    }

    /// Parse resource text; `path` is only used in error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let root = parse_literal(text).map_err(|source| BootstrapError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entities = Vec::new();
        for (key, value) in table(&root, ENTITIES_TABLE, path)? {
            let name = string_key(key, ENTITIES_TABLE, path)?;
            let id = value
                .as_int()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| {
                    BootstrapError::schema(
                        path,
                        format!("{ENTITIES_TABLE}[{name:?}] must be a non-negative int, got {}", value.kind()),
                    )
                })?;
            entities.push((name, id));
        }

        let mut triples = Vec::new();
        for (key, value) in table(&root, TRIPLES_TABLE, path)? {
            let triple = string_key(key, TRIPLES_TABLE, path)?;
            let id = value.as_int().filter(|id| *id >= 0).ok_or_else(|| {
                BootstrapError::schema(
                    path,
                    format!("{TRIPLES_TABLE}[{triple:?}] must be a non-negative int"),
                )
            })?;
            triples.push((triple, id));
        }

        let mut adjacency = Vec::new();
        for (key, value) in table(&root, ADJACENCY_TABLE, path)? {
            let entity = string_key(key, ADJACENCY_TABLE, path)?;
            let items = value.as_seq().ok_or_else(|| {
                BootstrapError::schema(
                    path,
                    format!("{ADJACENCY_TABLE}[{entity:?}] must be a list, got {}", value.kind()),
                )
            })?;
            let facts = items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        BootstrapError::schema(
                            path,
                            format!("{ADJACENCY_TABLE}[{entity:?}] holds a {}, expected str", item.kind()),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            adjacency.push((entity, facts));
        }

        Ok(Self {
            path: path.to_path_buf(),
            entities,
            triples,
            adjacency,
        })
    }
}

fn table<'a>(root: &'a Literal, name: &str, path: &Path) -> Result<&'a [(Literal, Literal)]> {
    let value = root
        .get(name)
        .ok_or_else(|| BootstrapError::schema(path, format!("missing table `{name}`")))?;
    value.as_dict().ok_or_else(|| {
        BootstrapError::schema(path, format!("`{name}` must be a dict, got {}", value.kind()))
    })
}

fn string_key(key: &Literal, table: &str, path: &Path) -> Result<String> {
    key.as_str().map(str::to_string).ok_or_else(|| {
        BootstrapError::schema(path, format!("`{table}` has a {} key, expected str", key.kind()))
    })
}

/// Split `"head, relation, tail"` into its three parts.
pub fn split_triple(text: &str) -> Option<(&str, &str, &str)> {
    let mut parts = text.split(", ");
    let triple = (parts.next()?, parts.next()?, parts.next()?);
    parts.next().is_none().then_some(triple)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE: &str = r#"{
        'csk_entities': ['dog', 'bark'],
        'dict_csk_entities': {'dog': 0, 'bark': 1, 'cat': 2},
        'dict_csk_triples': {'dog, CapableOf, bark': 0, 'cat, IsA, pet': 1},
        'dict_csk': {'dog': ['dog, CapableOf, bark'], 'cat': []},
    }"#;

    #[test]
    fn reads_tables_in_file_order() {
        let res = KnowledgeResource::parse(RESOURCE, Path::new("resource.txt")).unwrap();
        assert_eq!(
            res.entities,
            vec![("dog".into(), 0), ("bark".into(), 1), ("cat".into(), 2)]
        );
        assert_eq!(res.triples[1], ("cat, IsA, pet".to_string(), 1));
        assert_eq!(res.adjacency[0].1, vec!["dog, CapableOf, bark".to_string()]);
        assert!(res.adjacency[1].1.is_empty());
    }

    #[test]
    fn missing_table_is_schema_error() {
        let err = KnowledgeResource::parse("{'dict_csk_entities': {}}", Path::new("r.txt"))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Schema { .. }), "{err}");
    }

    #[test]
    fn wrong_value_kind_is_schema_error() {
        let text = "{'dict_csk_entities': {'dog': 'x'}, 'dict_csk_triples': {}, 'dict_csk': {}}";
        assert!(matches!(
            KnowledgeResource::parse(text, Path::new("r.txt")),
            Err(BootstrapError::Schema { .. })
        ));
    }

    #[test]
    fn malformed_text_is_parse_error() {
        assert!(matches!(
            KnowledgeResource::parse("{'dict_csk': [}", Path::new("r.txt")),
            Err(BootstrapError::Parse { .. })
        ));
    }

    #[test]
    fn splits_triples() {
        assert_eq!(split_triple("a, r, b"), Some(("a", "r", "b")));
        assert_eq!(split_triple("a, r"), None);
        assert_eq!(split_triple("a, r, b, c"), None);
    }
}
