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
/// Defines the finite element system the nonlinear solver works on.
///
/// The system owns the authoritative solution storage: a distributed
/// (global) solution and a node local, ghosted copy that residual and
/// Jacobian assembly read from.
use std::ops::{Deref, DerefMut};
use crate::dist_vec::DistVector;
use crate::dof_map::{ConstraintEnforcer, DofMap};


pub trait NonlinearSystem {
    fn n_dofs(&self) -> usize;

    /// Distributed solution
    fn solution(&self) -> &DistVector;
    fn solution_mut(&mut self) -> &mut DistVector;

    /// Local ghosted solution, refreshed by `update`
    fn current_local_solution(&self) -> &DistVector;

    /// Localize the distributed solution into the ghosted buffer.
    /// Collective.
    fn update(&mut self);

    /// Local count of constrained dofs
    fn n_constrained_dofs(&self) -> usize;

    /// Enforce constraints on the distributed solution.  Collective.
    fn enforce_constraints_exactly(&mut self);

    /// Enforce constraints on the local ghosted solution
    fn enforce_constraints_exactly_local(&mut self);

    /// Told by the solver which nonlinear step is being evaluated
    fn set_current_nonlinear_iteration(&mut self, _its: usize) {}

    fn current_nonlinear_iteration(&self) -> usize {
        0
    }
}


/// Scoped exchange of external storage with the system's solution slot.
///
/// On construction the external vector takes the place of the system
/// solution; when the guard is dropped the two are swapped back, on every
/// exit path.  Nothing is copied.
pub struct SolutionSwap<'g, S: NonlinearSystem + ?Sized> {
    sys: &'g mut S,
    ext: &'g mut DistVector,
}

impl<'g, S: NonlinearSystem + ?Sized> SolutionSwap<'g, S> {
    pub fn new(sys: &'g mut S, ext: &'g mut DistVector) -> Self {
        sys.solution_mut().swap(ext);
        Self { sys, ext }
    }
}

impl<'g, S: NonlinearSystem + ?Sized> Deref for SolutionSwap<'g, S> {
    type Target = S;
    fn deref(&self) -> &S {
        self.sys
    }
}

impl<'g, S: NonlinearSystem + ?Sized> DerefMut for SolutionSwap<'g, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.sys
    }
}

impl<'g, S: NonlinearSystem + ?Sized> Drop for SolutionSwap<'g, S> {
    fn drop(&mut self) {
        self.sys.solution_mut().swap(self.ext);
    }
}


/// Basic implicit system: one distributed solution, its ghosted copy and a
/// dof map with constraints.  Single rank, so localizing is a copy.
#[derive(Clone, Debug)]
pub struct ImplicitSystem {
    name: String,
    dof_map: DofMap,
    solution: DistVector,
    current_local_solution: DistVector,
    nonlinear_iteration: usize,
}

impl ImplicitSystem {
    pub fn new(name: &str, n_dofs: usize) -> Self {
        Self::with_dof_map(name, DofMap::new(n_dofs))
    }

    pub fn with_dof_map(name: &str, dof_map: DofMap) -> Self {
        let n = dof_map.n_dofs();
        Self {
            name: name.to_string(),
            dof_map,
            solution: DistVector::new(n),
            current_local_solution: DistVector::new(n),
            nonlinear_iteration: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dof_map
    }

    pub fn dof_map_mut(&mut self) -> &mut DofMap {
        &mut self.dof_map
    }
}

impl NonlinearSystem for ImplicitSystem {
    fn n_dofs(&self) -> usize {
        self.dof_map.n_dofs()
    }

    fn solution(&self) -> &DistVector {
        &self.solution
    }

    fn solution_mut(&mut self) -> &mut DistVector {
        &mut self.solution
    }

    fn current_local_solution(&self) -> &DistVector {
        &self.current_local_solution
    }

    fn update(&mut self) {
        self.current_local_solution = self.solution.clone();
        self.current_local_solution.close();
    }

    fn n_constrained_dofs(&self) -> usize {
        self.dof_map.n_constrained_dofs()
    }

    fn enforce_constraints_exactly(&mut self) {
        self.dof_map.enforce_constraints_exactly(&mut self.solution);
    }

    fn enforce_constraints_exactly_local(&mut self) {
        self.dof_map.enforce_constraints_exactly(&mut self.current_local_solution);
    }

    fn set_current_nonlinear_iteration(&mut self, its: usize) {
        self.nonlinear_iteration = its;
    }

    fn current_nonlinear_iteration(&self) -> usize {
        self.nonlinear_iteration
    }
}
