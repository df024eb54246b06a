//! Dense row-major `i32` buffers.
//!
//! `IntArray` is the unit of exchange between the store and its callers: the
//! packer fills one per shard and column, the store hands one back for every
//! read, and the collator concatenates and trims them into batches.

use crate::{Result, StoreError};

/// A dense, row-major n-dimensional `i32` array.
///
/// The leading dimension is the row dimension. A 1-D array has one element per
/// row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntArray {
    shape: Vec<usize>,
    data: Vec<i32>,
}

impl IntArray {
    /// Zero-filled array of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0; shape.iter().product()],
        }
    }

    pub fn from_vec(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || data.len() != expected {
            return Err(StoreError::Shape {
                name: "<buffer>".to_string(),
                message: format!(
                    "shape {shape:?} needs {expected} elements, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape without the row dimension.
    pub fn inner_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Number of elements in one row.
    pub fn row_len(&self) -> usize {
        self.inner_shape().iter().product()
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<i32> {
        self.data
    }

    pub fn row(&self, i: usize) -> &[i32] {
        let n = self.row_len();
        &self.data[i * n..(i + 1) * n]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [i32] {
        let n = self.row_len();
        &mut self.data[i * n..(i + 1) * n]
    }

    /// Element at a full multi-index.
    pub fn get(&self, index: &[usize]) -> i32 {
        debug_assert_eq!(index.len(), self.shape.len());
        let mut flat = 0;
        for (i, dim) in index.iter().zip(&self.shape) {
            flat = flat * dim + i;
        }
        self.data[flat]
    }

    /// Sum of every element of row `i`.
    pub fn row_sum(&self, i: usize) -> i64 {
        self.row(i).iter().map(|&v| v as i64).sum()
    }

    /// New array holding the given rows in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let n = self.row_len();
        let mut data = Vec::with_capacity(rows.len() * n);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        let mut shape = self.shape.clone();
        shape[0] = rows.len();
        Self { shape, data }
    }

    /// Copy of this array with every row re-laid out to `inner`.
    ///
    /// Dimensions that shrink are truncated, dimensions that grow are zero
    /// padded. The rank must not change.
    pub fn with_inner_shape(&self, inner: &[usize]) -> Self {
        assert_eq!(inner.len(), self.inner_shape().len(), "rank mismatch");
        if inner == self.inner_shape() {
            return self.clone();
        }
        let mut shape = Vec::with_capacity(inner.len() + 1);
        shape.push(self.rows());
        shape.extend_from_slice(inner);
        let mut out = Self::zeros(&shape);
        for r in 0..self.rows() {
            copy_region(self.row(r), self.inner_shape(), out.row_mut(r), inner);
        }
        out
    }

    /// Stack arrays along the row dimension. Inner shapes must agree.
    pub fn concat_rows(parts: &[IntArray]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(StoreError::Shape {
                name: "<buffer>".to_string(),
                message: "cannot concatenate zero arrays".to_string(),
            });
        };
        let inner = first.inner_shape();
        let mut rows = 0;
        for part in parts {
            if part.inner_shape() != inner {
                return Err(StoreError::Shape {
                    name: "<buffer>".to_string(),
                    message: format!(
                        "inner shape {:?} does not match {:?}",
                        part.inner_shape(),
                        inner
                    ),
                });
            }
            rows += part.rows();
        }
        let mut data = Vec::with_capacity(rows * first.row_len());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = rows;
        Ok(Self { shape, data })
    }
}

/// Copy the overlapping region of one row-major block into another.
///
/// `src` is laid out as `src_shape`, `dst` as `dst_shape`; both have the same
/// rank. Elements outside the overlap in `dst` are left untouched.
pub(crate) fn copy_region(src: &[i32], src_shape: &[usize], dst: &mut [i32], dst_shape: &[usize]) {
    match src_shape.len() {
        0 => dst[0] = src[0],
        1 => {
            let n = src_shape[0].min(dst_shape[0]);
            dst[..n].copy_from_slice(&src[..n]);
        }
        _ => {
            let n = src_shape[0].min(dst_shape[0]);
            let src_stride: usize = src_shape[1..].iter().product();
            let dst_stride: usize = dst_shape[1..].iter().product();
            for i in 0..n {
                copy_region(
                    &src[i * src_stride..(i + 1) * src_stride],
                    &src_shape[1..],
                    &mut dst[i * dst_stride..(i + 1) * dst_stride],
                    &dst_shape[1..],
                );
            }
        }
    }
}
