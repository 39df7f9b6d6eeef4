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
/// Error types shared by the adapter, the engine interface and the
/// reference collaborators.
use std::fmt;
use thiserror::Error;


/// User callback roles.  Used to report which slot was misconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackRole {
    Residual,
    Jacobian,
    ResidualAndJacobian,
    PostCheck,
    NullSpace,
    TransposeNullSpace,
    NearNullSpace,
    PreSolve,
}

impl fmt::Display for CallbackRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CallbackRole::Residual => "Residual",
            CallbackRole::Jacobian => "Jacobian",
            CallbackRole::ResidualAndJacobian => "combined Residual & Jacobian",
            CallbackRole::PostCheck => "solve postcheck",
            CallbackRole::NullSpace => "null space",
            CallbackRole::TransposeNullSpace => "transpose null space",
            CallbackRole::NearNullSpace => "near null space",
            CallbackRole::PreSolve => "presolve",
        };
        write!(f, "{}", s)
    }
}


#[derive(Debug, Error)]
pub enum SolverError {
    /// A function and an object were both supplied for the same role
    #[error("cannot specify both a function and object to compute the {0}!")]
    BothSupplied(CallbackRole),

    /// No residual (or combined) source was configured
    #[error("Unable to compute residual and/or Jacobian!")]
    UnableToCompute,

    /// Non-zero status from a delegated engine call
    #[error("nonlinear engine error {code}: {msg}")]
    Engine { code: i32, msg: String },

    #[error("nonlinear engine used before init()")]
    NotInitialized,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid value for option -{name}: {value:?}")]
    InvalidOption { name: String, value: String },

    #[error("invalid constraint on dof {dof}: {msg}")]
    InvalidConstraint { dof: usize, msg: String },
}

impl SolverError {
    pub fn engine(code: i32, msg: impl Into<String>) -> Self {
        SolverError::Engine { code, msg: msg.into() }
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;
