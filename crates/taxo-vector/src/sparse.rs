//! Sparse vectors and their on-disk matrix form

use std::path::Path;

use serde::{Deserialize, Serialize};
use taxo_core::{Result, TaxoError};

/// A sparse vector with strictly increasing indices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Build from unordered (index, value) pairs; duplicate indices are summed
    /// and zero entries dropped
    pub fn from_pairs(mut pairs: Vec<(u32, f32)>) -> Self {
        pairs.sort_by_key(|(i, _)| *i);

        let mut indices: Vec<u32> = Vec::with_capacity(pairs.len());
        let mut values: Vec<f32> = Vec::with_capacity(pairs.len());
        for (index, value) in pairs {
            match indices.last() {
                Some(&last) if last == index => {
                    if let Some(v) = values.last_mut() {
                        *v += value;
                    }
                }
                _ => {
                    indices.push(index);
                    values.push(value);
                }
            }
        }

        let mut vector = Self { indices, values };
        vector.retain_nonzero();
        vector
    }

    fn retain_nonzero(&mut self) {
        let (indices, values): (Vec<u32>, Vec<f32>) = self
            .indices
            .iter()
            .zip(self.values.iter())
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (*i, *v))
            .unzip();
        self.indices = indices;
        self.values = values;
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// True when every component is zero
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Sum of components
    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }

    /// Euclidean norm
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Scale to unit length; zero vectors are left untouched
    pub fn normalize(&mut self) {
        let norm = self.norm();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }

    /// Dot product by merging the two index lists
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut acc = 0.0;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }
}

/// Cosine distance given precomputed norms, clamped to [0, 1]
///
/// Components are non-negative for tf-idf vectors, so cosine similarity is
/// already in [0, 1]; the clamp only absorbs rounding.
pub fn cosine_distance(a: &SparseVector, a_norm: f32, b: &SparseVector, b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 1.0;
    }
    let similarity = (a.dot(b) / (a_norm * b_norm)).clamp(0.0, 1.0);
    1.0 - similarity
}

/// Row-major collection of sparse vectors sharing one dimension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    pub dimension: usize,
    pub rows: Vec<SparseVector>,
}

impl SparseMatrix {
    pub fn new(dimension: usize, rows: Vec<SparseVector>) -> Self {
        Self { dimension, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", path.display()))
        })?;
        serde_json::to_writer(std::io::BufWriter::new(file), self).map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Read from JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| TaxoError::NotFound(format!("{}: {e}", path.display())))?;
        let matrix: Self = serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            TaxoError::ParseError(format!("Invalid sparse vectors {}: {e}", path.display()))
        })?;

        if let Some(bad) = matrix
            .rows
            .iter()
            .flat_map(|row| row.indices.iter())
            .find(|i| **i as usize >= matrix.dimension)
        {
            return Err(TaxoError::ParseError(format!(
                "Sparse vector index {bad} exceeds dimension {}",
                matrix.dimension
            )));
        }
        Ok(matrix)
    }
}
