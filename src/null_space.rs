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
/// Null space construction for the Jacobian.
///
/// The user supplies raw mode vectors (rigid body modes, constant pressure
/// modes, ...), we orthonormalize them and hand the basis to the engine by
/// attaching it to the Jacobian matrix.
use log::warn;
use crate::dist_vec::DistVector;
use crate::error::{CallbackRole, Result};
use crate::nl_callbacks::{Source, SubspaceSlot};


/// Which null space of the Jacobian a basis describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullSpaceKind {
    /// Null space of J
    Null,
    /// Null space of J^T
    Transpose,
    /// Near null space, consumed by multigrid type preconditioners
    Near,
}

impl NullSpaceKind {
    pub fn role(&self) -> CallbackRole {
        match self {
            NullSpaceKind::Null => CallbackRole::NullSpace,
            NullSpaceKind::Transpose => CallbackRole::TransposeNullSpace,
            NullSpaceKind::Near => CallbackRole::NearNullSpace,
        }
    }
}


/// Orthonormal basis, in the order the modes were supplied
#[derive(Clone, Debug)]
pub struct NullSpace {
    vectors: Vec<DistVector>,
}

impl NullSpace {
    /// Wrap vectors that are already orthonormal
    pub fn from_orthonormal(vectors: Vec<DistVector>) -> Self {
        Self { vectors }
    }

    pub fn dim(&self) -> usize {
        self.vectors.len()
    }

    pub fn vectors(&self) -> &[DistVector] {
        &self.vectors
    }

    /// v <- v - sum_i (v . q_i) q_i
    pub fn remove_from(&self, v: &mut DistVector) {
        let dots: Vec<f64> = self.vectors.iter().map(|q| -v.dot(q)).collect();
        v.maxpy(&dots, &self.vectors);
    }

    pub fn is_orthonormal(&self, tol: f64) -> bool {
        for (i, qi) in self.vectors.iter().enumerate() {
            for (j, qj) in self.vectors.iter().enumerate() {
                let expect = if i == j { 1.0 } else { 0.0 };
                if (qi.dot(qj) - expect).abs() > tol {
                    return false;
                }
            }
        }
        true
    }
}


/// Classical Gram-Schmidt over the modes in input order.
///
/// Mode 0 is normalized as is.  For mode k all dot products against the
/// finalized modes [0,k) are computed first, then the weighted sum is
/// subtracted in one pass and the result normalized.  Classical (not
/// modified) GS loses orthogonality for ill conditioned mode sets.
pub fn orthonormalize(mut modes: Vec<DistVector>) -> Vec<DistVector> {
    if modes.is_empty() {
        return modes;
    }
    if modes[0].normalize() == 0.0 {
        warn!("null space mode 0 has zero norm and can not be normalized");
    }
    for i in 1..modes.len() {
        let (done, rest) = modes.split_at_mut(i);
        let mode = &mut rest[0];
        let mut dots: Vec<f64> = done.iter().map(|q| mode.dot(q)).collect();
        for d in dots.iter_mut() {
            *d *= -1.;
        }
        mode.maxpy(&dots, done);
        if mode.normalize() == 0.0 {
            warn!("null space mode {} is linearly dependent on previous modes", i);
        }
    }
    modes
}


/// Build a null space from the configured mode source.
///
/// Returns `None` when the source produced no modes.  The modes handed out
/// by the source are duplicated, the duplicates are orthonormalized and
/// moved into the returned basis.
pub fn build_mat_null_space<S>(
    slot: &mut SubspaceSlot<'_, S>,
    role: CallbackRole,
    sys: &S,
) -> Result<Option<NullSpace>> {
    let mut sp: Vec<DistVector> = Vec::new();
    match slot.resolve(role)? {
        Source::Function(f) => f(&mut sp, sys),
        Source::Object(o) => o.compute(&mut sp, sys),
        Source::Empty => {}
    }
    if sp.is_empty() {
        return Ok(None);
    }

    let mut modes = Vec::with_capacity(sp.len());
    for v in sp.iter() {
        let mut m = v.duplicate();
        m.copy_from(v)?;
        modes.push(m);
    }
    Ok(Some(NullSpace::from_orthonormal(orthonormalize(modes))))
}
