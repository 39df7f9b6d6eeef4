/*
 * Copyright© 2025 UT-Battelle, LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
/// Distributed matrix storage for Jacobians.
///
/// Single rank, dense backed faer storage.  Null spaces built by the adapter are attached
/// here, the engine's linear stage reads them back.
use faer::prelude::*;
use crate::dist_vec::DistVector;
use crate::error::{Result, SolverError};
use crate::null_space::{NullSpace, NullSpaceKind};


#[derive(Clone, Debug)]
pub struct DistMatrix {
    values: Mat<f64>,
    closed: bool,
    null_space: Option<NullSpace>,
    transpose_null_space: Option<NullSpace>,
    near_null_space: Option<NullSpace>,
}

impl DistMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            values: Mat::zeros(n, n),
            closed: true,
            null_space: None,
            transpose_null_space: None,
            near_null_space: None,
        }
    }

    /// Build from row-major entries, for testing
    pub fn from_rows(rows: &[&[f64]]) -> Self {
        let n = rows.len();
        let mut out = Self::new(n);
        out.values = Mat::from_fn(n, n, |i, j| rows[i][j]);
        out
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, val: f64) {
        self.values[(i, j)] = val;
        self.closed = false;
    }

    pub fn add(&mut self, i: usize, j: usize, val: f64) {
        self.values[(i, j)] += val;
        self.closed = false;
    }

    /// Zero all entries, keeps attached null spaces
    pub fn zero(&mut self) {
        self.values = Mat::zeros(self.nrows(), self.ncols());
        self.closed = true;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// y = A x
    pub fn mult(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        if x.len() != self.ncols() {
            return Err(SolverError::DimensionMismatch { expected: self.ncols(), actual: x.len() });
        }
        let ax: Mat<f64> = self.values.as_ref() * x.as_mat();
        *y = DistVector::from_mat(ax.as_ref());
        Ok(())
    }

    pub fn diagonal(&self) -> DistVector {
        DistVector::from_fn(self.nrows(), |i| self.values[(i, i)])
    }

    pub fn set_null_space(&mut self, kind: NullSpaceKind, ns: NullSpace) {
        match kind {
            NullSpaceKind::Null => self.null_space = Some(ns),
            NullSpaceKind::Transpose => self.transpose_null_space = Some(ns),
            NullSpaceKind::Near => self.near_null_space = Some(ns),
        }
    }

    pub fn null_space(&self, kind: NullSpaceKind) -> Option<&NullSpace> {
        match kind {
            NullSpaceKind::Null => self.null_space.as_ref(),
            NullSpaceKind::Transpose => self.transpose_null_space.as_ref(),
            NullSpaceKind::Near => self.near_null_space.as_ref(),
        }
    }
}
