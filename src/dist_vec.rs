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
/// Distributed vector storage.
///
/// Single rank implementation of the distributed vector the adapter hands
/// to the nonlinear engine.  Entries live in a faer column.  Writes leave
/// the vector "open" until `close()` is called, mirroring the assembly
/// contract of parallel vectors where cached off-process contributions only
/// become visible after finalization.
use faer::prelude::*;
use crate::error::{Result, SolverError};


#[derive(Clone, Debug)]
pub struct DistVector {
    data: Mat<f64>,
    closed: bool,
}

impl Default for DistVector {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DistVector {
    /// Zero vector of global size n
    pub fn new(n: usize) -> Self {
        Self {
            data: Mat::zeros(n, 1),
            closed: true,
        }
    }

    pub fn from_slice(vals: &[f64]) -> Self {
        Self {
            data: Mat::from_fn(vals.len(), 1, |i, _j| vals[i]),
            closed: true,
        }
    }

    /// Copy of the first column of a faer view
    pub fn from_mat(m: MatRef<'_, f64>) -> Self {
        Self {
            data: m.subcols(0, 1).to_owned(),
            closed: true,
        }
    }

    pub fn from_fn(n: usize, f: impl Fn(usize) -> f64) -> Self {
        Self {
            data: Mat::from_fn(n, 1, |i, _j| f(i)),
            closed: true,
        }
    }

    /// New vector with the same layout, all entries zero
    pub fn duplicate(&self) -> Self {
        Self::new(self.len())
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> f64 {
        self.data[(i, 0)]
    }

    pub fn set(&mut self, i: usize, val: f64) {
        self.data[(i, 0)] = val;
        self.closed = false;
    }

    pub fn add(&mut self, i: usize, val: f64) {
        self.data[(i, 0)] += val;
        self.closed = false;
    }

    pub fn zero(&mut self) {
        self.data = Mat::zeros(self.len(), 1);
        self.closed = true;
    }

    /// Finalize pending writes
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Exchange storage with another vector.  No entries are copied.
    pub fn swap(&mut self, other: &mut DistVector) {
        std::mem::swap(self, other);
    }

    pub fn copy_from(&mut self, other: &DistVector) -> Result<()> {
        self.check_len(other)?;
        self.data = other.data.clone();
        self.closed = true;
        Ok(())
    }

    pub fn dot(&self, other: &DistVector) -> f64 {
        let prod: Mat<f64> = self.data.transpose() * &other.data;
        prod[(0, 0)]
    }

    pub fn norm_l2(&self) -> f64 {
        self.data.norm_l2()
    }

    pub fn norm_max(&self) -> f64 {
        self.data.norm_max()
    }

    pub fn scale(&mut self, alpha: f64) {
        self.data = faer::scale(alpha) * &self.data;
    }

    /// self += alpha * x
    pub fn axpy(&mut self, alpha: f64, x: &DistVector) {
        self.data += faer::scale(alpha) * &x.data;
    }

    /// self += sum_j alphas[j] * xs[j]
    pub fn maxpy(&mut self, alphas: &[f64], xs: &[DistVector]) {
        for (alpha, x) in alphas.iter().zip(xs) {
            self.axpy(*alpha, x);
        }
    }

    /// Scale to unit l2 norm.  Returns the norm before scaling.
    /// A zero vector is left unchanged.
    pub fn normalize(&mut self) -> f64 {
        let nrm = self.norm_l2();
        if nrm > 0.0 {
            self.scale(1.0 / nrm);
        }
        nrm
    }

    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.data[(i, 0)]).collect()
    }

    pub fn as_mat(&self) -> MatRef<'_, f64> {
        self.data.as_ref()
    }

    pub(crate) fn check_len(&self, other: &DistVector) -> Result<()> {
        if self.len() != other.len() {
            return Err(SolverError::DimensionMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        Ok(())
    }
}
