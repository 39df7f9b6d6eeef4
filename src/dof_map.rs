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
/// Degree of freedom constraints.
///
/// A constraint row ties one dof to a linear combination of unconstrained
/// dofs plus an inhomogeneous part:
///
///   u_d = sum_j c_j u_j + rhs
///
/// Hanging node interpolation and Dirichlet values both fit this form.
use std::collections::BTreeMap;
use crate::dist_vec::DistVector;
use crate::error::{Result, SolverError};


/// Anything that can project a solution buffer onto the constraint set
pub trait ConstraintEnforcer {
    /// Number of constrained dofs
    fn n_constrained_dofs(&self) -> usize;

    /// Overwrite every constrained entry of `v` so its defining relation
    /// holds exactly
    fn enforce_constraints_exactly(&self, v: &mut DistVector);
}


#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintRow {
    pub coeffs: Vec<(usize, f64)>,
    pub rhs: f64,
}


#[derive(Clone, Debug, Default)]
pub struct DofMap {
    n_dofs: usize,
    constraints: BTreeMap<usize, ConstraintRow>,
}

impl DofMap {
    pub fn new(n_dofs: usize) -> Self {
        Self {
            n_dofs,
            constraints: BTreeMap::new(),
        }
    }

    pub fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    pub fn is_constrained(&self, dof: usize) -> bool {
        self.constraints.contains_key(&dof)
    }

    pub fn constraint_row(&self, dof: usize) -> Option<&ConstraintRow> {
        self.constraints.get(&dof)
    }

    /// Add u_dof = sum c_j u_j + rhs.
    ///
    /// Sources must be unconstrained and the constrained dof may not already
    /// be a source of another row, so one pass of `enforce_constraints_exactly`
    /// is exact.
    pub fn add_constraint_row(&mut self, dof: usize, coeffs: Vec<(usize, f64)>, rhs: f64) -> Result<()> {
        if dof >= self.n_dofs {
            return Err(SolverError::InvalidConstraint { dof, msg: "dof out of range".into() });
        }
        for (j, _c) in coeffs.iter() {
            if *j >= self.n_dofs {
                return Err(SolverError::InvalidConstraint { dof, msg: format!("source dof {} out of range", j) });
            }
            if *j == dof || self.constraints.contains_key(j) {
                return Err(SolverError::InvalidConstraint { dof, msg: format!("source dof {} is constrained", j) });
            }
        }
        let is_source = self.constraints.values()
            .any(|row| row.coeffs.iter().any(|(j, _)| *j == dof));
        if is_source {
            return Err(SolverError::InvalidConstraint { dof, msg: "dof is already a constraint source".into() });
        }
        self.constraints.insert(dof, ConstraintRow { coeffs, rhs });
        Ok(())
    }

    /// Constrain a dof to a fixed value
    pub fn add_dirichlet(&mut self, dof: usize, value: f64) -> Result<()> {
        self.add_constraint_row(dof, Vec::new(), value)
    }
}

impl ConstraintEnforcer for DofMap {
    fn n_constrained_dofs(&self) -> usize {
        self.constraints.len()
    }

    fn enforce_constraints_exactly(&self, v: &mut DistVector) {
        if self.constraints.is_empty() {
            return;
        }
        for (dof, row) in self.constraints.iter() {
            let val = row.coeffs.iter()
                .fold(row.rhs, |acc, (j, c)| acc + c * v.get(*j));
            v.set(*dof, val);
        }
        v.close();
    }
}
