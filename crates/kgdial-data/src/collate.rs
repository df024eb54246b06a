//! Batch collation.
//!
//! Rows arrive as [`RowBlock`]s padded to the dataset-wide maxima. [`collate`]
//! stacks them and shrinks every field to what this particular batch needs:
//!
//! 1. drop rows whose triple tensor is all padding,
//! 2. stable sort by post length, longest first,
//! 3. trim sequence columns to the longest valid length in the batch and the
//!    knowledge fan-out to the widest occupied slot list.

use std::cmp::Reverse;
use std::ops::Deref;

use kgdial_store::{IntArray, StoreError};
use kgdial_vocab::PAD_IDX;

/// Store array names, in collation order.
pub const FIELDS: [&str; 7] = [
    "post",
    "post_length",
    "response",
    "response_length",
    "triple",
    "entity",
    "response_triple",
];

/// The seven fields of a run of rows, sharing the leading row dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBlock {
    pub post: IntArray,
    pub post_length: IntArray,
    pub response: IntArray,
    pub response_length: IntArray,
    pub triple: IntArray,
    pub entity: IntArray,
    pub response_triple: IntArray,
}

impl RowBlock {
    /// Build a block by producing each field by name.
    pub fn try_from_fields<E>(
        mut field: impl FnMut(&'static str) -> Result<IntArray, E>,
    ) -> Result<Self, E> {
        Ok(Self {
            post: field("post")?,
            post_length: field("post_length")?,
            response: field("response")?,
            response_length: field("response_length")?,
            triple: field("triple")?,
            entity: field("entity")?,
            response_triple: field("response_triple")?,
        })
    }

    pub fn rows(&self) -> usize {
        self.post.rows()
    }

    pub fn fields(&self) -> [(&'static str, &IntArray); 7] {
        [
            ("post", &self.post),
            ("post_length", &self.post_length),
            ("response", &self.response),
            ("response_length", &self.response_length),
            ("triple", &self.triple),
            ("entity", &self.entity),
            ("response_triple", &self.response_triple),
        ]
    }

    pub fn get(&self, name: &str) -> Option<&IntArray> {
        self.fields()
            .into_iter()
            .find(|(field, _)| *field == name)
            .map(|(_, array)| array)
    }

    fn map(&self, mut f: impl FnMut(&'static str, &IntArray) -> IntArray) -> Self {
        Self {
            post: f("post", &self.post),
            post_length: f("post_length", &self.post_length),
            response: f("response", &self.response),
            response_length: f("response_length", &self.response_length),
            triple: f("triple", &self.triple),
            entity: f("entity", &self.entity),
            response_triple: f("response_triple", &self.response_triple),
        }
    }
}

/// A collated batch, handed to the training collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch(RowBlock);

impl Batch {
    pub fn len(&self) -> usize {
        self.0.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field name -> array mapping.
    pub fn fields(&self) -> [(&'static str, &IntArray); 7] {
        self.0.fields()
    }

    pub fn into_inner(self) -> RowBlock {
        self.0
    }
}

impl Deref for Batch {
    type Target = RowBlock;

    fn deref(&self) -> &RowBlock {
        &self.0
    }
}

/// Merge fetched blocks into one trimmed batch.
///
/// Blocks whose inner shapes differ are zero-padded to the widest before
/// stacking. The result may be empty if every row is degenerate.
pub fn collate(blocks: Vec<RowBlock>) -> Result<Batch, StoreError> {
    let stacked = stack(&blocks)?;

    let mut keep: Vec<usize> = (0..stacked.rows())
        .filter(|&r| stacked.triple.row_sum(r) != 0)
        .collect();
    keep.sort_by_key(|&r| Reverse(stacked.post_length.row(r)[0]));
    let rows = stacked.map(|_, array| array.select_rows(&keep));

    let width = |column: &IntArray, lengths: &IntArray| {
        let longest = lengths.data().iter().copied().max().unwrap_or(0).max(0) as usize;
        longest.min(column.inner_shape()[0])
    };
    let max_pl = width(&rows.post, &rows.post_length);
    let max_rl = width(&rows.response, &rows.response_length);
    let max_tl = occupied_fan_out(&rows.entity, 1)
        .max(occupied_fan_out(&rows.triple, 3))
        .max(1)
        .min(rows.entity.inner_shape()[1]);

    Ok(Batch(rows.map(|name, array| match name {
        "post" => array.with_inner_shape(&[max_pl]),
        "response" => array.with_inner_shape(&[max_rl]),
        "triple" => array.with_inner_shape(&[max_pl, max_tl, 3]),
        "entity" => array.with_inner_shape(&[max_pl, max_tl]),
        "response_triple" => array.with_inner_shape(&[max_rl, 3]),
        _ => array.clone(),
    })))
}

fn stack(blocks: &[RowBlock]) -> Result<RowBlock, StoreError> {
    RowBlock::try_from_fields(|name| {
        let parts: Vec<&IntArray> = blocks.iter().filter_map(|b| b.get(name)).collect();
        let widest = widest_inner(name, &parts)?;
        let padded: Vec<IntArray> = parts
            .into_iter()
            .map(|part| {
                if part.inner_shape() == widest.as_slice() {
                    part.clone()
                } else {
                    part.with_inner_shape(&widest)
                }
            })
            .collect();
        IntArray::concat_rows(&padded).map_err(|e| match e {
            StoreError::Shape { message, .. } => StoreError::Shape {
                name: name.to_string(),
                message,
            },
            other => other,
        })
    })
}

fn widest_inner(name: &str, parts: &[&IntArray]) -> Result<Vec<usize>, StoreError> {
    let Some(first) = parts.first() else {
        return Err(StoreError::Shape {
            name: name.to_string(),
            message: "nothing to collate".to_string(),
        });
    };
    let mut widest = first.inner_shape().to_vec();
    for part in &parts[1..] {
        if part.inner_shape().len() != widest.len() {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!(
                    "rank mismatch: {:?} vs {:?}",
                    part.inner_shape(),
                    widest
                ),
            });
        }
        for (w, &d) in widest.iter_mut().zip(part.inner_shape()) {
            *w = (*w).max(d);
        }
    }
    Ok(widest)
}

/// Widest run of occupied slots at any token position.
///
/// `array` is `[rows, positions, slots, ..]`; a slot is occupied when any of
/// its `slot_len` values is not padding.
fn occupied_fan_out(array: &IntArray, slot_len: usize) -> usize {
    let slots = array.inner_shape()[1];
    let position_len = slots * slot_len;
    array
        .data()
        .chunks_exact(position_len.max(1))
        .map(|position| {
            position
                .chunks_exact(slot_len)
                .rposition(|slot| slot.iter().any(|&v| v != PAD_IDX))
                .map_or(0, |k| k + 1)
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgdial_vocab::{EOS_IDX, NAF_IDX, NAF_TRIPLE, SOS_IDX};

    const MSL: usize = 16;
    const MTL: usize = 4;

    /// One row with `post_len` tokens (SOS/EOS included) and `fan_out`
    /// knowledge slots at token position 1.
    fn row(post_len: usize, response_len: usize, fan_out: usize, marker: i32) -> RowBlock {
        let mut post = IntArray::zeros(&[1, MSL]);
        post.row_mut(0)[0] = SOS_IDX;
        for t in 1..post_len - 1 {
            post.row_mut(0)[t] = marker;
        }
        post.row_mut(0)[post_len - 1] = EOS_IDX;

        let mut response = IntArray::zeros(&[1, MSL]);
        response.row_mut(0)[..response_len].fill(marker);

        let mut triple = IntArray::zeros(&[1, MSL, MTL, 3]);
        let mut entity = IntArray::zeros(&[1, MSL, MTL]);
        for p in [0, post_len - 1] {
            triple.row_mut(0)[p * MTL * 3..p * MTL * 3 + 3].copy_from_slice(&NAF_TRIPLE);
            entity.row_mut(0)[p * MTL] = NAF_IDX;
        }
        for k in 0..fan_out {
            let at = (MTL + k) * 3;
            triple.row_mut(0)[at..at + 3].copy_from_slice(&[marker, 2, marker]);
            entity.row_mut(0)[MTL + k] = marker;
        }

        RowBlock {
            post,
            post_length: IntArray::from_vec(&[1], vec![post_len as i32]).unwrap(),
            response,
            response_length: IntArray::from_vec(&[1], vec![response_len as i32]).unwrap(),
            triple,
            entity,
            response_triple: IntArray::zeros(&[1, MSL, 3]),
        }
    }

    fn degenerate() -> RowBlock {
        let mut block = row(3, 3, 0, 9);
        block.triple = IntArray::zeros(&[1, MSL, MTL, 3]);
        block
    }

    #[test]
    fn drops_rows_with_empty_triples() {
        let batch = collate(vec![degenerate(), row(4, 3, 1, 7)]).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.post.row(0)[1], 7);
    }

    #[test]
    fn trims_to_batch_maxima() {
        let batch = collate(vec![row(5, 3, 1, 7), row(12, 6, 2, 8)]).unwrap();
        assert_eq!(batch.post.shape(), &[2, 12]);
        assert_eq!(batch.response.shape(), &[2, 6]);
        assert_eq!(batch.triple.shape(), &[2, 12, 2, 3]);
        assert_eq!(batch.entity.shape(), &[2, 12, 2]);
        assert_eq!(batch.response_triple.shape(), &[2, 6, 3]);
        assert_eq!(batch.post_length.shape(), &[2]);
    }

    #[test]
    fn sorts_by_post_length_descending_and_stably() {
        let batch = collate(vec![
            row(4, 3, 1, 1),
            row(9, 3, 1, 2),
            row(4, 3, 1, 3),
            row(6, 3, 1, 4),
        ])
        .unwrap();
        assert_eq!(batch.post_length.data(), &[9, 6, 4, 4]);
        let markers: Vec<i32> = (0..4).map(|r| batch.post.row(r)[1]).collect();
        assert_eq!(markers, vec![2, 4, 1, 3]);
    }

    #[test]
    fn fan_out_keeps_every_occupied_slot() {
        // entity list shorter than the triple list at the same position
        let mut block = row(5, 3, 3, 7);
        block.entity.row_mut(0)[MTL + 2] = 0;
        let batch = collate(vec![block]).unwrap();
        assert_eq!(batch.triple.shape()[2], 3);
        assert_eq!(batch.triple.get(&[0, 1, 2, 0]), 7);
    }

    #[test]
    fn pads_blocks_of_different_widths() {
        let mut narrow = row(4, 3, 1, 5);
        narrow = narrow.map(|name, array| match name {
            "post" | "response" => array.with_inner_shape(&[6]),
            "triple" => array.with_inner_shape(&[6, MTL, 3]),
            "entity" => array.with_inner_shape(&[6, MTL]),
            "response_triple" => array.with_inner_shape(&[6, 3]),
            _ => array.clone(),
        });
        let batch = collate(vec![narrow, row(10, 3, 1, 6)]).unwrap();
        assert_eq!(batch.post.shape(), &[2, 10]);
        assert_eq!(batch.post.row(1)[..4], [SOS_IDX, 5, 5, EOS_IDX]);
    }

    #[test]
    fn all_degenerate_gives_empty_batch() {
        let batch = collate(vec![degenerate(), degenerate()]).unwrap();
        assert!(batch.is_empty());
        assert!(collate(Vec::new()).is_err());
    }

    #[test]
    fn fields_are_named_in_order() {
        let batch = collate(vec![row(4, 3, 1, 1)]).unwrap();
        let names: Vec<&str> = batch.fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, FIELDS);
    }
}
