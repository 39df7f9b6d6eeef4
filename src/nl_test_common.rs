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
/// Common systems and helpers for testing
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::dof_map::DofMap;
use crate::nl_callbacks::{ComputeJacobian, ComputeResidual};
use crate::nl_sys::{ImplicitSystem, NonlinearSystem};


/// Vector filled with standard normal samples, reproducible by seed
pub fn random_vector(n: usize, seed: u64) -> DistVector {
    let mut rng = StdRng::seed_from_u64(seed);
    let vals: Vec<f64> = (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
    DistVector::from_slice(&vals)
}


/// One dof system for x*x - 2 = 0, solution sqrt(2)
pub fn sqrt2_system(x0: f64) -> ImplicitSystem {
    let mut sys = ImplicitSystem::new("sqrt2", 1);
    sys.solution_mut().set(0, x0);
    sys.solution_mut().close();
    sys
}

// x^2 - 2  has zeros at -sqrt(2), sqrt(2)
pub fn sqrt2_residual(x: &DistVector, r: &mut DistVector, _sys: &ImplicitSystem) {
    r.add(0, x.get(0) * x.get(0) - 2.0);
}

pub fn sqrt2_jacobian(x: &DistVector, jac: &mut DistMatrix, _sys: &ImplicitSystem) {
    jac.add(0, 0, 2.0 * x.get(0));
}


/// Three dof system
///
///   u0^3 - 1 = 0
///   u1^2 - 4 = 0
///   u2 = (u0 + u1) / 2    (hanging node constraint)
///
/// Solution (1, 2, 1.5).  The constrained row of the residual measures the
/// constraint itself, so it vanishes on the constrained local solution.
pub fn constrained_system() -> ImplicitSystem {
    let mut dm = DofMap::new(3);
    // rows built from valid dofs, can not fail
    let _ = dm.add_constraint_row(2, vec![(0, 0.5), (1, 0.5)], 0.0);
    ImplicitSystem::with_dof_map("constrained", dm)
}

pub struct ConstrainedResidual;

impl ComputeResidual<ImplicitSystem> for ConstrainedResidual {
    fn residual(&mut self, x: &DistVector, r: &mut DistVector, _sys: &ImplicitSystem) {
        r.set(0, x.get(0).powi(3) - 1.0);
        r.set(1, x.get(1).powi(2) - 4.0);
        r.set(2, x.get(2) - 0.5 * (x.get(0) + x.get(1)));
    }
}

pub struct ConstrainedJacobian;

impl ComputeJacobian<ImplicitSystem> for ConstrainedJacobian {
    fn jacobian(&mut self, x: &DistVector, jac: &mut DistMatrix, _sys: &ImplicitSystem) {
        jac.set(0, 0, 3.0 * x.get(0).powi(2));
        jac.set(1, 1, 2.0 * x.get(1));
        jac.set(2, 0, -0.5);
        jac.set(2, 1, -0.5);
        jac.set(2, 2, 1.0);
    }
}
