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
/// Routes engine callbacks to the user's residual, Jacobian and post-check
/// code.
///
/// Before any user code sees a solution the engine's iterate is pushed
/// through the system: it is swapped into the solution slot, localized into
/// the ghosted buffer and swapped back out, then constraints are enforced on
/// the ghosted buffer.  User code always reads `current_local_solution`.
use log::trace;
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::{CallbackRole, Result, SolverError};
use crate::nl_callbacks::{CallbackSlots, Source};
use crate::nl_engine::{EngineCallbacks, PostCheckFlags};
use crate::nl_sys::{NonlinearSystem, SolutionSwap};
use crate::preconditioner::Preconditioner;


/// Bookkeeping for a single solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolveState {
    pub current_nonlinear_iteration: usize,
    pub residual_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub postcheck_calls: usize,
}


/// Engine facing side of the solver adapter, alive for one engine solve
pub struct CallbackDispatcher<'d, 'a, S: NonlinearSystem> {
    sys: &'d mut S,
    slots: &'d mut CallbackSlots<'a, S>,
    pc: Option<&'d mut (dyn Preconditioner + 'a)>,
    zero_out_residual: bool,
    zero_out_jacobian: bool,
    state: SolveState,
}

impl<'d, 'a, S: NonlinearSystem> CallbackDispatcher<'d, 'a, S> {
    pub fn new(
        sys: &'d mut S,
        slots: &'d mut CallbackSlots<'a, S>,
        pc: Option<&'d mut (dyn Preconditioner + 'a)>,
        zero_out_residual: bool,
        zero_out_jacobian: bool,
    ) -> Self {
        Self {
            sys,
            slots,
            pc,
            zero_out_residual,
            zero_out_jacobian,
            state: SolveState::default(),
        }
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    /// Make `x` visible to user code as the constrained local solution
    fn sync_solution(&mut self, its: usize, x: &mut DistVector) {
        self.state.current_nonlinear_iteration = its;
        self.sys.set_current_nonlinear_iteration(its);
        {
            let mut swapped = SolutionSwap::new(&mut *self.sys, x);
            swapped.update();
        }
        self.sys.enforce_constraints_exactly_local();
    }

    fn assemble_jacobian(&mut self, target: &mut DistMatrix) -> Result<()> {
        if self.zero_out_jacobian {
            target.zero();
        }
        let sys: &S = &*self.sys;
        let x = sys.current_local_solution();
        let jac_src = self.slots.jacobian.resolve(CallbackRole::Jacobian)?;
        let combined = self.slots.residual_and_jacobian.resolve(CallbackRole::ResidualAndJacobian)?;
        match (jac_src, combined) {
            (Source::Function(f), _) => f(x, &mut *target, sys),
            (Source::Object(o), _) => o.jacobian(x, &mut *target, sys),
            (Source::Empty, Source::Function(f)) => f(x, None, Some(&mut *target), sys),
            (Source::Empty, Source::Object(o)) => o.residual_and_jacobian(x, None, Some(&mut *target), sys),
            (Source::Empty, Source::Empty) => return Err(SolverError::UnableToCompute),
        }
        target.close();
        Ok(())
    }
}

impl<'d, 'a, S: NonlinearSystem> EngineCallbacks for CallbackDispatcher<'d, 'a, S> {
    fn residual(&mut self, its: usize, x: &mut DistVector, r: &mut DistVector) -> Result<()> {
        trace!("residual evaluation at step {}", its);
        self.state.residual_evaluations += 1;
        self.sync_solution(its, x);

        if self.zero_out_residual {
            r.zero();
        }
        let sys: &S = &*self.sys;
        let x_local = sys.current_local_solution();
        let res_src = self.slots.residual.resolve(CallbackRole::Residual)?;
        let combined = self.slots.residual_and_jacobian.resolve(CallbackRole::ResidualAndJacobian)?;
        match (res_src, combined) {
            (Source::Function(f), _) => f(x_local, &mut *r, sys),
            (Source::Object(o), _) => o.residual(x_local, &mut *r, sys),
            (Source::Empty, Source::Function(f)) => f(x_local, Some(&mut *r), None, sys),
            (Source::Empty, Source::Object(o)) => o.residual_and_jacobian(x_local, Some(&mut *r), None, sys),
            (Source::Empty, Source::Empty) => return Err(SolverError::UnableToCompute),
        }
        r.close();
        Ok(())
    }

    fn jacobian(
        &mut self,
        its: usize,
        x: &mut DistVector,
        jac: &mut DistMatrix,
        pmat: Option<&mut DistMatrix>,
    ) -> Result<()> {
        trace!("jacobian evaluation at step {}", its);
        self.state.jacobian_evaluations += 1;
        self.sync_solution(its, x);

        match pmat {
            Some(pc_mat) => {
                self.assemble_jacobian(pc_mat)?;
                jac.close();
            }
            None => self.assemble_jacobian(jac)?,
        }
        Ok(())
    }

    fn postcheck(
        &mut self,
        x: &DistVector,
        y: &mut DistVector,
        w: &mut DistVector,
    ) -> Result<PostCheckFlags> {
        self.state.postcheck_calls += 1;
        let mut flags = PostCheckFlags::default();

        let has_constraints = self.sys.n_constrained_dofs() > 0;
        let sys: &S = &*self.sys;
        match self.slots.postcheck.resolve(CallbackRole::PostCheck)? {
            Source::Function(f) => f(x, &mut *y, &mut *w, &mut flags.changed_y, &mut flags.changed_w, sys),
            Source::Object(o) => o.postcheck(x, &mut *y, &mut *w, &mut flags.changed_y, &mut flags.changed_w, sys),
            Source::Empty => {
                if !has_constraints {
                    return Ok(flags);
                }
            }
        }

        if has_constraints {
            // y is left as the user set it
            let mut swapped = SolutionSwap::new(&mut *self.sys, w);
            swapped.enforce_constraints_exactly();
            flags.changed_w = true;
        }
        Ok(flags)
    }

    fn pc_setup(&mut self, pmat: &DistMatrix) -> Result<()> {
        match self.pc.as_mut() {
            Some(pc) => pc.setup(pmat),
            None => Ok(()),
        }
    }

    fn pc_apply(&mut self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        match self.pc.as_ref() {
            Some(pc) => pc.apply(x, y),
            None => {
                *y = x.clone();
                Ok(())
            }
        }
    }
}


#[cfg(test)]
mod test_nl_dispatch {
    use assert_approx_eq::assert_approx_eq;
    use std::cell::Cell;
    use crate::dof_map::DofMap;
    use crate::nl_callbacks::*;
    use crate::nl_sys::ImplicitSystem;
    use crate::preconditioner::JacobiPreconditioner;
    use super::*;

    fn dispatcher<'d, 'a>(
        sys: &'d mut ImplicitSystem,
        slots: &'d mut CallbackSlots<'a, ImplicitSystem>,
    ) -> CallbackDispatcher<'d, 'a, ImplicitSystem> {
        CallbackDispatcher::new(sys, slots, None, true, true)
    }

    #[test]
    fn test_unable_to_compute() {
        let mut sys = ImplicitSystem::new("t", 2);
        let mut slots = CallbackSlots::default();
        let mut d = dispatcher(&mut sys, &mut slots);
        let mut x = DistVector::new(2);
        let mut r = DistVector::new(2);
        assert!(matches!(d.residual(0, &mut x, &mut r), Err(SolverError::UnableToCompute)));
        let mut jac = DistMatrix::new(2);
        assert!(matches!(d.jacobian(0, &mut x, &mut jac, None), Err(SolverError::UnableToCompute)));
    }

    #[test]
    fn test_residual_sees_engine_iterate() {
        let mut sys = ImplicitSystem::new("t", 2);
        sys.solution_mut().set(0, 99.0);
        let seen_its = Cell::new(usize::MAX);
        let mut slots = CallbackSlots::default();
        slots.residual.set_function(Box::new(|x: &DistVector, r: &mut DistVector, s: &ImplicitSystem| {
            seen_its.set(s.current_nonlinear_iteration());
            r.set(0, x.get(0) + r.get(0));
            r.set(1, x.get(1));
        }));
        let mut d = dispatcher(&mut sys, &mut slots);
        let mut x = DistVector::from_slice(&[3.0, 4.0]);
        // stale content must be zeroed before the callback adds to it
        let mut r = DistVector::from_slice(&[100.0, 100.0]);
        d.residual(4, &mut x, &mut r).unwrap();
        assert_eq!(r.to_vec(), vec![3.0, 4.0]);
        assert!(r.is_closed());
        assert_eq!(d.state().current_nonlinear_iteration, 4);
        assert_eq!(d.state().residual_evaluations, 1);
        drop(d);
        assert_eq!(seen_its.get(), 4);
        // engine vector and system solution are back in place
        assert_eq!(x.to_vec(), vec![3.0, 4.0]);
        assert_eq!(sys.solution().get(0), 99.0);
    }

    #[test]
    fn test_no_zeroing() {
        let mut sys = ImplicitSystem::new("t", 1);
        let mut slots = CallbackSlots::default();
        slots.residual.set_function(Box::new(|_x: &DistVector, r: &mut DistVector, _s: &ImplicitSystem| {
            r.add(0, 1.0);
        }));
        slots.jacobian.set_function(Box::new(|_x: &DistVector, j: &mut DistMatrix, _s: &ImplicitSystem| {
            j.add(0, 0, 1.0);
        }));
        let mut d = CallbackDispatcher::new(&mut sys, &mut slots, None, false, false);
        let mut x = DistVector::new(1);
        let mut r = DistVector::from_slice(&[5.0]);
        d.residual(0, &mut x, &mut r).unwrap();
        assert_eq!(r.get(0), 6.0);
        let mut jac = DistMatrix::from_rows(&[&[2.0]]);
        d.jacobian(0, &mut x, &mut jac, None).unwrap();
        assert_eq!(jac.get(0, 0), 3.0);
        assert!(jac.is_closed());
    }

    #[test]
    fn test_local_solution_constrained() {
        let mut dm = DofMap::new(3);
        dm.add_constraint_row(2, vec![(0, 0.5), (1, 0.5)], 0.0).unwrap();
        let mut sys = ImplicitSystem::with_dof_map("t", dm);
        let mut slots = CallbackSlots::default();
        slots.residual.set_function(Box::new(|x: &DistVector, r: &mut DistVector, _s: &ImplicitSystem| {
            for i in 0..3 {
                r.set(i, x.get(i));
            }
        }));
        let mut d = dispatcher(&mut sys, &mut slots);
        let mut x = DistVector::from_slice(&[2.0, 4.0, 0.0]);
        let mut r = DistVector::new(3);
        d.residual(0, &mut x, &mut r).unwrap();
        assert_approx_eq!(r.get(2), 3.0, 1e-15);
        // the engine's iterate itself is untouched
        assert_eq!(x.get(2), 0.0);
    }

    struct Combined {
        n_res: usize,
        n_jac: usize,
    }

    impl ComputeResidualAndJacobian<ImplicitSystem> for Combined {
        fn residual_and_jacobian(
            &mut self,
            x: &DistVector,
            r: Option<&mut DistVector>,
            jac: Option<&mut DistMatrix>,
            _sys: &ImplicitSystem,
        ) {
            assert!(r.is_some() != jac.is_some());
            if let Some(r) = r {
                self.n_res += 1;
                r.set(0, x.get(0) * x.get(0) - 2.0);
            }
            if let Some(jac) = jac {
                self.n_jac += 1;
                jac.set(0, 0, 2.0 * x.get(0));
            }
        }
    }

    #[test]
    fn test_combined_object() {
        let mut sys = ImplicitSystem::new("t", 1);
        let mut slots = CallbackSlots::default();
        slots.residual_and_jacobian.set_object(Box::new(Combined { n_res: 0, n_jac: 0 }));
        let mut d = dispatcher(&mut sys, &mut slots);
        let mut x = DistVector::from_slice(&[3.0]);
        let mut r = DistVector::new(1);
        let mut jac = DistMatrix::new(1);
        let mut pmat = DistMatrix::new(1);
        d.residual(1, &mut x, &mut r).unwrap();
        d.jacobian(1, &mut x, &mut jac, Some(&mut pmat)).unwrap();
        assert_eq!(r.get(0), 7.0);
        // distinct preconditioning matrix is the assembly target
        assert_eq!(pmat.get(0, 0), 6.0);
        assert_eq!(jac.get(0, 0), 0.0);
        assert!(pmat.is_closed() && jac.is_closed());
    }

    #[test]
    fn test_both_supplied_residual_and_jacobian() {
        let mut sys = ImplicitSystem::new("t", 1);
        let mut x = DistVector::new(1);
        let mut r = DistVector::new(1);
        let mut jac = DistMatrix::new(1);

        let mut slots = CallbackSlots::default();
        slots.residual.set_function(Box::new(|_x: &DistVector, _r: &mut DistVector, _s: &ImplicitSystem| {}));
        slots.residual.set_object(Box::new(ResidualOnly));
        {
            let mut d = dispatcher(&mut sys, &mut slots);
            assert!(matches!(
                d.residual(0, &mut x, &mut r),
                Err(SolverError::BothSupplied(CallbackRole::Residual))));
        }

        let mut slots = CallbackSlots::default();
        slots.jacobian.set_function(Box::new(|_x: &DistVector, _j: &mut DistMatrix, _s: &ImplicitSystem| {}));
        slots.jacobian.set_object(Box::new(JacobianOnly));
        {
            let mut d = dispatcher(&mut sys, &mut slots);
            assert!(matches!(
                d.jacobian(0, &mut x, &mut jac, None),
                Err(SolverError::BothSupplied(CallbackRole::Jacobian))));
        }

        // combined pair is reported through both callbacks, even when a
        // residual function exists
        let mut slots = CallbackSlots::default();
        slots.residual.set_function(Box::new(|_x: &DistVector, _r: &mut DistVector, _s: &ImplicitSystem| {}));
        slots.residual_and_jacobian.set_object(Box::new(Combined { n_res: 0, n_jac: 0 }));
        slots.residual_and_jacobian.set_function(Box::new(
            |_x: &DistVector, _r: Option<&mut DistVector>, _j: Option<&mut DistMatrix>, _s: &ImplicitSystem| {}));
        let mut d = dispatcher(&mut sys, &mut slots);
        assert!(matches!(
            d.residual(0, &mut x, &mut r),
            Err(SolverError::BothSupplied(CallbackRole::ResidualAndJacobian))));
        assert!(matches!(
            d.jacobian(0, &mut x, &mut jac, None),
            Err(SolverError::BothSupplied(CallbackRole::ResidualAndJacobian))));
    }

    struct ResidualOnly;
    impl ComputeResidual<ImplicitSystem> for ResidualOnly {
        fn residual(&mut self, _x: &DistVector, _r: &mut DistVector, _sys: &ImplicitSystem) {}
    }

    struct JacobianOnly;
    impl ComputeJacobian<ImplicitSystem> for JacobianOnly {
        fn jacobian(&mut self, _x: &DistVector, _jac: &mut DistMatrix, _sys: &ImplicitSystem) {}
    }

    #[test]
    fn test_postcheck_fast_path() {
        let mut sys = ImplicitSystem::new("t", 2);
        let mut slots = CallbackSlots::default();
        let mut d = dispatcher(&mut sys, &mut slots);
        let x = DistVector::from_slice(&[1.0, 1.0]);
        let mut y = DistVector::from_slice(&[0.5, 0.5]);
        let mut w = DistVector::from_slice(&[0.5, 0.5]);
        let flags = d.postcheck(&x, &mut y, &mut w).unwrap();
        assert_eq!(flags, PostCheckFlags { changed_y: false, changed_w: false });
        assert_eq!(w.to_vec(), vec![0.5, 0.5]);
        assert_eq!(y.to_vec(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_postcheck_user_flags() {
        let mut sys = ImplicitSystem::new("t", 1);
        let mut slots = CallbackSlots::default();
        slots.postcheck.set_function(Box::new(
            |_x: &DistVector, y: &mut DistVector, _w: &mut DistVector, cy: &mut bool, _cw: &mut bool, _s: &ImplicitSystem| {
                y.scale(0.5);
                *cy = true;
            }));
        let mut d = dispatcher(&mut sys, &mut slots);
        let x = DistVector::from_slice(&[1.0]);
        let mut y = DistVector::from_slice(&[2.0]);
        let mut w = DistVector::from_slice(&[-1.0]);
        let flags = d.postcheck(&x, &mut y, &mut w).unwrap();
        assert_eq!(flags, PostCheckFlags { changed_y: true, changed_w: false });
        assert_eq!(y.get(0), 1.0);
    }

    #[test]
    fn test_postcheck_with_constraints() {
        let mut dm = DofMap::new(2);
        dm.add_dirichlet(1, 5.0).unwrap();
        let mut sys = ImplicitSystem::with_dof_map("t", dm);
        let called = Cell::new(false);
        let mut slots = CallbackSlots::default();
        slots.postcheck.set_function(Box::new(
            |_x: &DistVector, _y: &mut DistVector, _w: &mut DistVector, _cy: &mut bool, _cw: &mut bool, _s: &ImplicitSystem| {
                called.set(true);
            }));
        let mut d = dispatcher(&mut sys, &mut slots);
        let x = DistVector::from_slice(&[0.0, 0.0]);
        let mut y = DistVector::from_slice(&[1.0, 1.0]);
        let mut w = DistVector::from_slice(&[2.0, 2.0]);
        let flags = d.postcheck(&x, &mut y, &mut w).unwrap();
        drop(d);
        assert!(called.get());
        // the user reported nothing but constraints changed w
        assert!(flags.changed_w);
        assert!(!flags.changed_y);
        assert_eq!(w.to_vec(), vec![2.0, 5.0]);
        assert_eq!(y.to_vec(), vec![1.0, 1.0]);
        assert_eq!(sys.solution().to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_postcheck_constraints_only() {
        let mut dm = DofMap::new(2);
        dm.add_dirichlet(0, -1.0).unwrap();
        let mut sys = ImplicitSystem::with_dof_map("t", dm);
        let mut slots = CallbackSlots::default();
        let mut d = dispatcher(&mut sys, &mut slots);
        let x = DistVector::new(2);
        let mut y = DistVector::new(2);
        let mut w = DistVector::from_slice(&[3.0, 3.0]);
        let flags = d.postcheck(&x, &mut y, &mut w).unwrap();
        assert!(flags.changed_w);
        assert_eq!(w.to_vec(), vec![-1.0, 3.0]);
    }

    struct NoopPostCheck;
    impl ComputePostCheck<ImplicitSystem> for NoopPostCheck {
        fn postcheck(
            &mut self,
            _x: &DistVector,
            _y: &mut DistVector,
            _w: &mut DistVector,
            _changed_y: &mut bool,
            _changed_w: &mut bool,
            _sys: &ImplicitSystem,
        ) {}
    }

    #[test]
    fn test_postcheck_both_supplied() {
        let mut sys = ImplicitSystem::new("t", 1);
        let mut slots = CallbackSlots::default();
        slots.postcheck.set_object(Box::new(NoopPostCheck));
        slots.postcheck.set_function(Box::new(
            |_x: &DistVector, _y: &mut DistVector, _w: &mut DistVector, _cy: &mut bool, _cw: &mut bool, _s: &ImplicitSystem| {}));
        let mut d = dispatcher(&mut sys, &mut slots);
        let x = DistVector::new(1);
        let mut y = DistVector::new(1);
        let mut w = DistVector::new(1);
        assert!(matches!(
            d.postcheck(&x, &mut y, &mut w),
            Err(SolverError::BothSupplied(CallbackRole::PostCheck))));
    }

    #[test]
    fn test_shell_pc_forwarding() {
        let mut sys = ImplicitSystem::new("t", 2);
        let mut slots = CallbackSlots::default();
        let mut pc = JacobiPreconditioner::new();
        let mut d = CallbackDispatcher::new(&mut sys, &mut slots, Some(&mut pc as &mut dyn Preconditioner), true, true);
        let a = DistMatrix::from_rows(&[&[2.0, 0.0], &[0.0, 4.0]]);
        d.pc_setup(&a).unwrap();
        let x = DistVector::from_slice(&[1.0, 1.0]);
        let mut y = DistVector::new(2);
        d.pc_apply(&x, &mut y).unwrap();
        assert_eq!(y.to_vec(), vec![0.5, 0.25]);
        drop(d);
        assert_eq!(pc.n_setups(), 1);
    }
}
