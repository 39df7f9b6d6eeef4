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
/// Interface between the solver adapter and a Newton type nonlinear engine.
///
/// The engine owns the outer iteration, the inner linear solves and the line
/// search.  Everything problem specific is reached through `EngineCallbacks`
/// which the adapter implements for the duration of one solve.
use std::fmt;
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::Result;
use crate::options::{OptionsDatabase, SolverSettings};


/// Why the engine stopped.  Non-negative codes are convergence (or still
/// iterating), negative codes are divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergedReason {
    ConvergedFnormAbs,
    ConvergedFnormRelative,
    ConvergedSnormRelative,
    ConvergedIts,
    ConvergedIterating,
    DivergedFunctionDomain,
    DivergedFunctionCount,
    DivergedLinearSolve,
    DivergedFnormNan,
    DivergedMaxIts,
    DivergedLineSearch,
    DivergedInnerSolve,
    DivergedLocalMin,
    /// Code not known to this crate, kept as reported
    Other(i32),
}

impl ConvergedReason {
    pub fn code(&self) -> i32 {
        match self {
            ConvergedReason::ConvergedFnormAbs => 2,
            ConvergedReason::ConvergedFnormRelative => 3,
            ConvergedReason::ConvergedSnormRelative => 4,
            ConvergedReason::ConvergedIts => 5,
            ConvergedReason::ConvergedIterating => 0,
            ConvergedReason::DivergedFunctionDomain => -1,
            ConvergedReason::DivergedFunctionCount => -2,
            ConvergedReason::DivergedLinearSolve => -3,
            ConvergedReason::DivergedFnormNan => -4,
            ConvergedReason::DivergedMaxIts => -5,
            ConvergedReason::DivergedLineSearch => -6,
            ConvergedReason::DivergedInnerSolve => -7,
            ConvergedReason::DivergedLocalMin => -8,
            ConvergedReason::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            2 => ConvergedReason::ConvergedFnormAbs,
            3 => ConvergedReason::ConvergedFnormRelative,
            4 => ConvergedReason::ConvergedSnormRelative,
            5 => ConvergedReason::ConvergedIts,
            0 => ConvergedReason::ConvergedIterating,
            -1 => ConvergedReason::DivergedFunctionDomain,
            -2 => ConvergedReason::DivergedFunctionCount,
            -3 => ConvergedReason::DivergedLinearSolve,
            -4 => ConvergedReason::DivergedFnormNan,
            -5 => ConvergedReason::DivergedMaxIts,
            -6 => ConvergedReason::DivergedLineSearch,
            -7 => ConvergedReason::DivergedInnerSolve,
            -8 => ConvergedReason::DivergedLocalMin,
            c => ConvergedReason::Other(c),
        }
    }

    /// All diverged reasons are negative
    pub fn converged(&self) -> bool {
        converged_from_code(self.code())
    }
}

impl Default for ConvergedReason {
    fn default() -> Self {
        ConvergedReason::ConvergedIterating
    }
}

impl fmt::Display for ConvergedReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConvergedReason::ConvergedFnormAbs => "CONVERGED_FNORM_ABS",
            ConvergedReason::ConvergedFnormRelative => "CONVERGED_FNORM_RELATIVE",
            ConvergedReason::ConvergedSnormRelative => "CONVERGED_SNORM_RELATIVE",
            ConvergedReason::ConvergedIts => "CONVERGED_ITS",
            ConvergedReason::ConvergedIterating => "CONVERGED_ITERATING",
            ConvergedReason::DivergedFunctionDomain => "DIVERGED_FUNCTION_DOMAIN",
            ConvergedReason::DivergedFunctionCount => "DIVERGED_FUNCTION_COUNT",
            ConvergedReason::DivergedLinearSolve => "DIVERGED_LINEAR_SOLVE",
            ConvergedReason::DivergedFnormNan => "DIVERGED_FNORM_NAN",
            ConvergedReason::DivergedMaxIts => "DIVERGED_MAX_IT",
            ConvergedReason::DivergedLineSearch => "DIVERGED_LINE_SEARCH",
            ConvergedReason::DivergedInnerSolve => "DIVERGED_INNER",
            ConvergedReason::DivergedLocalMin => "DIVERGED_LOCAL_MIN",
            ConvergedReason::Other(code) => return write!(f, "UNKNOWN_REASON({})", code),
        };
        write!(f, "{}", s)
    }
}

/// Sign rule shared by every engine reason code
pub fn converged_from_code(code: i32) -> bool {
    code >= 0
}


/// Optional engine features the adapter checks before using them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCapability {
    TransposeNullSpace,
    NearNullSpace,
}


/// Outer iteration tolerances
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonlinearTolerances {
    pub atol: f64,
    pub rtol: f64,
    pub stol: f64,
    pub max_it: usize,
    pub max_funcs: usize,
}

impl Default for NonlinearTolerances {
    fn default() -> Self {
        NonlinearTolerances::from(&SolverSettings::default())
    }
}

impl From<&SolverSettings> for NonlinearTolerances {
    fn from(s: &SolverSettings) -> Self {
        Self {
            atol: s.absolute_residual_tolerance,
            rtol: s.relative_residual_tolerance,
            stol: s.relative_step_tolerance,
            max_it: s.max_nonlinear_iterations,
            max_funcs: s.max_function_evaluations,
        }
    }
}


/// Inner linear solve tolerances.  `None` keeps the engine's current value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinearTolerances {
    pub rtol: Option<f64>,
    pub atol: Option<f64>,
    pub dtol: Option<f64>,
    pub max_it: Option<usize>,
}


/// What a post-check changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostCheckFlags {
    pub changed_y: bool,
    pub changed_w: bool,
}


/// Problem callbacks an engine calls during `solve`.
///
/// Every call is sequential.  The vectors and matrices passed in are owned
/// by the engine and only borrowed for the duration of the call.
pub trait EngineCallbacks {
    /// r = R(x) at outer iteration `its`
    fn residual(&mut self, its: usize, x: &mut DistVector, r: &mut DistVector) -> Result<()>;

    /// Assemble the Jacobian at x.  `pmat` is a distinct preconditioning
    /// matrix, `None` when it is the same as `jac`.
    fn jacobian(
        &mut self,
        its: usize,
        x: &mut DistVector,
        jac: &mut DistMatrix,
        pmat: Option<&mut DistMatrix>,
    ) -> Result<()>;

    /// Line search post-check on old solution `x`, direction `y` and
    /// candidate `w`
    fn postcheck(
        &mut self,
        x: &DistVector,
        y: &mut DistVector,
        w: &mut DistVector,
    ) -> Result<PostCheckFlags>;

    /// Shell preconditioner setup
    fn pc_setup(&mut self, pmat: &DistMatrix) -> Result<()>;

    /// Shell preconditioner application, y = M^-1 x
    fn pc_apply(&mut self, x: &DistVector, y: &mut DistVector) -> Result<()>;
}


/// Nonlinear engine handle
pub trait NonlinearEngine {
    fn set_options_prefix(&mut self, prefix: &str);
    fn options_prefix(&self) -> Option<&str>;

    /// Progress monitor called with (iteration, |F|_2) once per outer step
    /// and once for the initial residual
    fn monitor_set(&mut self, monitor: Box<dyn FnMut(usize, f64)>);

    /// Register the residual.  The vector becomes the engine's retained
    /// function vector.
    fn set_function(&mut self, r: DistVector);

    /// Ask for the Jacobian callback.  Without it the engine differences
    /// the residual.
    fn set_jacobian(&mut self);

    /// Call the line search post-check
    fn set_post_check(&mut self);

    /// Use `pc_setup` / `pc_apply` as the preconditioner
    fn set_shell_preconditioner(&mut self);

    fn set_tolerances(&mut self, tol: NonlinearTolerances);
    fn tolerances(&self) -> NonlinearTolerances;

    fn set_linear_tolerances(&mut self, tol: LinearTolerances);

    /// Apply options found under this engine's prefix
    fn set_from_options(&mut self, db: &OptionsDatabase) -> Result<()>;

    fn supports(&self, cap: EngineCapability) -> bool;

    /// Solve R(x) = 0 starting from `x`.  The result is left in `x`.
    fn solve(
        &mut self,
        cb: &mut dyn EngineCallbacks,
        x: &mut DistVector,
        jac: &mut DistMatrix,
    ) -> Result<()>;

    fn iteration_number(&self) -> usize;
    fn linear_solve_iterations(&self) -> usize;
    fn converged_reason(&self) -> ConvergedReason;

    /// Function vector retained from the last evaluation
    fn function_vector(&self) -> Option<&DistVector>;
}
