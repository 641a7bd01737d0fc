//! Exact linear-scan backend

use serde::{Deserialize, Serialize};

use super::helpers::{check_dim, squared_l2, Neighbors, TopK};
use super::{BackendKind, SimilarityIndex};
use crate::window::Matrix;
use crate::{Result, SearchError};

/// Compares the query against every stored row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BruteForceIndex {
    data: Option<Matrix>,
}

impl BruteForceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        match &self.data {
            Some(data) if !data.is_well_formed() => {
                Err(SearchError::CorruptIndex("brute-force rows are malformed".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl SimilarityIndex for BruteForceIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::BruteForce
    }

    fn build(&mut self, matrix: &Matrix) -> Result<()> {
        if self.data.is_some() {
            return Err(SearchError::AlreadyBuilt);
        }
        if matrix.is_empty() {
            return Err(SearchError::EmptyCorpus);
        }
        self.data = Some(matrix.clone());
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.data.is_some()
    }

    fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Matrix::rows)
    }

    fn dim(&self) -> usize {
        self.data.as_ref().map_or(0, Matrix::dim)
    }

    fn query(&self, query: &[f32], k: usize) -> Result<Neighbors> {
        let data = self.data.as_ref().ok_or(SearchError::NotBuilt)?;
        check_dim(query, data.dim())?;

        let mut top = TopK::new(k.min(data.rows()));
        for (index, row) in data.iter_rows().enumerate() {
            top.push(squared_l2(query, row), index);
        }
        Ok(top.into_neighbors())
    }
}
