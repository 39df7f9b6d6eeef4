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
/// User preconditioners plugged into the engine's linear solve as a shell
/// preconditioner.
use log::debug;
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::{Result, SolverError};


pub trait Preconditioner {
    /// Called once when the engine is created and again before each solve
    fn init(&mut self) -> Result<()>;

    /// Matrix the preconditioner is built from, given before each solve
    fn set_matrix(&mut self, mat: &DistMatrix);

    /// Rebuild from the current preconditioning matrix.  Called by the
    /// engine after every Jacobian update.
    fn setup(&mut self, pmat: &DistMatrix) -> Result<()>;

    /// y = M^-1 x
    fn apply(&self, x: &DistVector, y: &mut DistVector) -> Result<()>;
}


/// Point Jacobi.  Zero diagonal entries are treated as 1.
#[derive(Clone, Debug, Default)]
pub struct JacobiPreconditioner {
    inv_diag: Option<DistVector>,
    n_setups: usize,
}

impl JacobiPreconditioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the inverse diagonal was rebuilt
    pub fn n_setups(&self) -> usize {
        self.n_setups
    }

    fn build(&mut self, mat: &DistMatrix) {
        let diag = mat.diagonal();
        self.inv_diag = Some(DistVector::from_fn(diag.len(), |i| {
            let d = diag.get(i);
            if d == 0.0 { 1.0 } else { 1.0 / d }
        }));
        self.n_setups += 1;
    }
}

impl Preconditioner for JacobiPreconditioner {
    fn init(&mut self) -> Result<()> {
        debug!("jacobi preconditioner init");
        Ok(())
    }

    fn set_matrix(&mut self, mat: &DistMatrix) {
        self.build(mat);
    }

    fn setup(&mut self, pmat: &DistMatrix) -> Result<()> {
        self.build(pmat);
        Ok(())
    }

    fn apply(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        let inv = self.inv_diag.as_ref()
            .ok_or_else(|| SolverError::engine(73, "jacobi preconditioner applied before setup"))?;
        x.check_len(inv)?;
        *y = DistVector::from_fn(x.len(), |i| inv.get(i) * x.get(i));
        Ok(())
    }
}
