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
/// User callback surface.
///
/// Every role can be filled either by a bare closure or by an object
/// implementing the matching `Compute*` trait.  Both forms may be stored;
/// asking a slot to `resolve` with both present is a configuration error
/// reported as `SolverError::BothSupplied`.
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::{CallbackRole, Result, SolverError};
use crate::null_space::NullSpaceKind;


/// Residual evaluator object
pub trait ComputeResidual<S> {
    /// Fill `r` with R(x).  `x` is the constrained local solution.
    fn residual(&mut self, x: &DistVector, r: &mut DistVector, sys: &S);
}

/// Jacobian evaluator object
pub trait ComputeJacobian<S> {
    fn jacobian(&mut self, x: &DistVector, jac: &mut DistMatrix, sys: &S);
}

/// Combined evaluator object.  Exactly one of `r` and `jac` is `Some`
/// for each call made by the adapter.
pub trait ComputeResidualAndJacobian<S> {
    fn residual_and_jacobian(
        &mut self,
        x: &DistVector,
        r: Option<&mut DistVector>,
        jac: Option<&mut DistMatrix>,
        sys: &S);
}

/// Line search post-check object
pub trait ComputePostCheck<S> {
    /// * `x` - old solution
    /// * `y` - search direction
    /// * `w` - candidate solution
    /// * `changed_y` / `changed_w` - set true if `y` / `w` were altered
    fn postcheck(
        &mut self,
        x: &DistVector,
        y: &mut DistVector,
        w: &mut DistVector,
        changed_y: &mut bool,
        changed_w: &mut bool,
        sys: &S);
}

/// Mode source object for null space construction
pub trait ComputeVectorSubspace<S> {
    fn compute(&mut self, sp: &mut Vec<DistVector>, sys: &S);
}

/// Hook run once per solve right before the engine takes over
pub trait ComputePreSolve<S> {
    fn presolve(&mut self, sys: &mut S);
}


pub type ResidualFn<'a, S> = dyn FnMut(&DistVector, &mut DistVector, &S) + 'a;
pub type JacobianFn<'a, S> = dyn FnMut(&DistVector, &mut DistMatrix, &S) + 'a;
pub type ResidualAndJacobianFn<'a, S> =
    dyn FnMut(&DistVector, Option<&mut DistVector>, Option<&mut DistMatrix>, &S) + 'a;
pub type PostCheckFn<'a, S> =
    dyn FnMut(&DistVector, &mut DistVector, &mut DistVector, &mut bool, &mut bool, &S) + 'a;
pub type VectorSubspaceFn<'a, S> = dyn FnMut(&mut Vec<DistVector>, &S) + 'a;
pub type PreSolveFn<'a, S> = dyn FnMut(&mut S) + 'a;


/// The single callable a slot resolved to
pub enum Source<'s, F: ?Sized, O: ?Sized> {
    Empty,
    Function(&'s mut F),
    Object(&'s mut O),
}

/// Function/object pair for one role
pub struct CallbackSlot<F: ?Sized, O: ?Sized> {
    function: Option<Box<F>>,
    object: Option<Box<O>>,
}

impl<F: ?Sized, O: ?Sized> Default for CallbackSlot<F, O> {
    fn default() -> Self {
        Self { function: None, object: None }
    }
}

impl<F: ?Sized, O: ?Sized> CallbackSlot<F, O> {
    pub fn set_function(&mut self, f: Box<F>) {
        self.function = Some(f);
    }

    pub fn set_object(&mut self, o: Box<O>) {
        self.object = Some(o);
    }

    pub fn clear(&mut self) {
        self.function = None;
        self.object = None;
    }

    /// Either form configured
    pub fn is_set(&self) -> bool {
        self.function.is_some() || self.object.is_some()
    }

    /// Pick the configured callable, failing if both forms are present
    pub fn resolve(&mut self, role: CallbackRole) -> Result<Source<'_, F, O>> {
        match (self.function.as_deref_mut(), self.object.as_deref_mut()) {
            (Some(_), Some(_)) => Err(SolverError::BothSupplied(role)),
            (Some(f), None) => Ok(Source::Function(f)),
            (None, Some(o)) => Ok(Source::Object(o)),
            (None, None) => Ok(Source::Empty),
        }
    }
}


pub type ResidualSlot<'a, S> = CallbackSlot<ResidualFn<'a, S>, dyn ComputeResidual<S> + 'a>;
pub type JacobianSlot<'a, S> = CallbackSlot<JacobianFn<'a, S>, dyn ComputeJacobian<S> + 'a>;
pub type ResidualAndJacobianSlot<'a, S> =
    CallbackSlot<ResidualAndJacobianFn<'a, S>, dyn ComputeResidualAndJacobian<S> + 'a>;
pub type PostCheckSlot<'a, S> = CallbackSlot<PostCheckFn<'a, S>, dyn ComputePostCheck<S> + 'a>;
pub type SubspaceSlot<'a, S> =
    CallbackSlot<VectorSubspaceFn<'a, S>, dyn ComputeVectorSubspace<S> + 'a>;
pub type PreSolveSlot<'a, S> = CallbackSlot<PreSolveFn<'a, S>, dyn ComputePreSolve<S> + 'a>;


/// All user callback slots held by the solver adapter
pub struct CallbackSlots<'a, S> {
    pub residual: ResidualSlot<'a, S>,
    pub jacobian: JacobianSlot<'a, S>,
    pub residual_and_jacobian: ResidualAndJacobianSlot<'a, S>,
    pub postcheck: PostCheckSlot<'a, S>,
    pub nullspace: SubspaceSlot<'a, S>,
    pub transpose_nullspace: SubspaceSlot<'a, S>,
    pub nearnullspace: SubspaceSlot<'a, S>,
    pub presolve: PreSolveSlot<'a, S>,
}

impl<'a, S> Default for CallbackSlots<'a, S> {
    fn default() -> Self {
        Self {
            residual: CallbackSlot::default(),
            jacobian: CallbackSlot::default(),
            residual_and_jacobian: CallbackSlot::default(),
            postcheck: CallbackSlot::default(),
            nullspace: CallbackSlot::default(),
            transpose_nullspace: CallbackSlot::default(),
            nearnullspace: CallbackSlot::default(),
            presolve: CallbackSlot::default(),
        }
    }
}

impl<'a, S> CallbackSlots<'a, S> {
    /// Something can produce a Jacobian: a Jacobian function or object, or a
    /// combined function or object
    pub fn has_jacobian_source(&self) -> bool {
        self.jacobian.is_set() || self.residual_and_jacobian.is_set()
    }

    pub fn subspace_mut(&mut self, kind: NullSpaceKind) -> &mut SubspaceSlot<'a, S> {
        match kind {
            NullSpaceKind::Null => &mut self.nullspace,
            NullSpaceKind::Transpose => &mut self.transpose_nullspace,
            NullSpaceKind::Near => &mut self.nearnullspace,
        }
    }
}
