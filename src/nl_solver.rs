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
/// Nonlinear solver adapter.
///
/// Binds an FE system to a Newton type engine: owns the engine handle
/// between `init` and `clear`, pushes tolerances and user options to it,
/// builds null spaces for the Jacobian and routes the engine's callbacks to
/// user residual / Jacobian / post-check code.
use log::{debug, error, info, warn};
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::{CallbackRole, Result, SolverError};
use crate::newton::NewtonKrylov;
use crate::nl_callbacks::*;
use crate::nl_dispatch::{CallbackDispatcher, SolveState};
use crate::nl_engine::*;
use crate::nl_sys::{NonlinearSystem, SolutionSwap};
use crate::null_space::{build_mat_null_space, NullSpaceKind};
use crate::options::{OptionsDatabase, SolverConfiguration, SolverSettings};
use crate::preconditioner::Preconditioner;


/// Creates a fresh engine on every `init` after a `clear`
pub type EngineFactory<'a> = Box<dyn FnMut() -> Box<dyn NonlinearEngine + 'a> + 'a>;


/// Outcome of one nonlinear solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveResult {
    pub iterations: usize,
    pub final_residual_norm: f64,
    pub converged: bool,
    pub reason: ConvergedReason,
    pub linear_iterations: usize,
    pub state: SolveState,
}

impl SolveResult {
    /// (outer iterations, final |R|_2)
    pub fn pair(&self) -> (usize, f64) {
        (self.iterations, self.final_residual_norm)
    }
}


/// One line of the default monitor
fn nl_step_line(its: usize, fnorm: f64) -> String {
    format!("  NL step {:2}, |residual|_2 = {:.6e}", its, fnorm)
}

fn print_nl_step(its: usize, fnorm: f64) {
    println!("{}", nl_step_line(its, fnorm));
}


pub struct NonlinearSolver<'a, S: NonlinearSystem> {
    system: S,
    engine: Option<Box<dyn NonlinearEngine + 'a>>,
    factory: EngineFactory<'a>,
    slots: CallbackSlots<'a, S>,
    settings: SolverSettings,
    options: OptionsDatabase,
    prefix: Option<String>,
    preconditioner: Option<Box<dyn Preconditioner + 'a>>,
    configuration: Option<Box<dyn SolverConfiguration + 'a>>,
    zero_out_residual: bool,
    zero_out_jacobian: bool,
    default_monitor: bool,
    reason: ConvergedReason,
    linear_iterations: usize,
    converged: bool,
}

impl<'a, S: NonlinearSystem> NonlinearSolver<'a, S> {
    /// Adapter over the built in Newton-Krylov engine
    pub fn new(system: S) -> Self {
        Self::with_engine_factory(
            system,
            Box::new(|| Box::new(NewtonKrylov::new()) as Box<dyn NonlinearEngine + 'a>))
    }

    pub fn with_engine_factory(system: S, factory: EngineFactory<'a>) -> Self {
        Self {
            system,
            engine: None,
            factory,
            slots: CallbackSlots::default(),
            settings: SolverSettings::default(),
            options: OptionsDatabase::default(),
            prefix: None,
            preconditioner: None,
            configuration: None,
            zero_out_residual: true,
            zero_out_jacobian: true,
            default_monitor: true,
            reason: ConvergedReason::ConvergedIterating,
            linear_iterations: 0,
            converged: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Create the engine if there is none.  Safe to call repeatedly.
    pub fn init(&mut self, name: Option<&str>) -> Result<()> {
        if self.engine.is_none() {
            let mut engine = (self.factory)();
            debug!("allocated nonlinear engine");

            if let Some(name) = name {
                engine.set_options_prefix(name);
            }
            if self.default_monitor {
                engine.monitor_set(Box::new(print_nl_step));
            }
            if let Some(cfg) = self.configuration.as_deref_mut() {
                cfg.set_options_during_init(engine.as_mut())?;
            }
            if let Some(pc) = self.preconditioner.as_deref_mut() {
                pc.init()?;
                engine.set_shell_preconditioner();
            }
            self.engine = Some(engine);
        }

        // only hook the line search when there is user code to run, the
        // engine otherwise pays for extra residual evaluations
        if self.slots.postcheck.is_set() {
            if let Some(engine) = self.engine.as_deref_mut() {
                engine.set_post_check();
            }
        }
        Ok(())
    }

    /// Release the engine.  Per solve bookkeeping goes back to its idle
    /// state.
    pub fn clear(&mut self) {
        if self.engine.take().is_some() {
            debug!("destroyed nonlinear engine");
        }
        self.system.set_current_nonlinear_iteration(0);
    }

    /// Solve R(x) = 0 with `solution` as initial guess and result.
    ///
    /// `residual` receives the final residual.  The trailing tolerance and
    /// iteration arguments are accepted for interface compatibility, the
    /// settings held by the adapter are used instead.
    pub fn solve(
        &mut self,
        jac: &mut DistMatrix,
        solution: &mut DistVector,
        residual: &mut DistVector,
        _tol: f64,
        _max_its: usize,
    ) -> Result<SolveResult> {
        // a failed solve must not report the previous verdict
        self.reason = ConvergedReason::ConvergedIterating;
        self.converged = false;
        self.linear_iterations = 0;
        let out = self.solve_impl(jac, solution, residual);
        if let Err(e) = &out {
            error!("nonlinear solve aborted: {}", e);
        }
        self.clear();
        out
    }

    fn solve_impl(
        &mut self,
        jac: &mut DistMatrix,
        solution: &mut DistVector,
        residual: &mut DistVector,
    ) -> Result<SolveResult> {
        let prefix = self.prefix.clone();
        self.init(prefix.as_deref())?;

        let n = self.system.n_dofs();
        for len in [solution.len(), residual.len(), jac.nrows()] {
            if len != n {
                return Err(SolverError::DimensionMismatch { expected: n, actual: len });
            }
        }

        let engine = self.engine.as_deref_mut().ok_or(SolverError::NotInitialized)?;

        engine.set_function(residual.clone());
        if self.slots.has_jacobian_source() {
            engine.set_jacobian();
        }

        for kind in [NullSpaceKind::Null, NullSpaceKind::Transpose, NullSpaceKind::Near] {
            if !self.slots.subspace_mut(kind).is_set() {
                continue;
            }
            let cap = match kind {
                NullSpaceKind::Transpose => Some(EngineCapability::TransposeNullSpace),
                NullSpaceKind::Near => Some(EngineCapability::NearNullSpace),
                NullSpaceKind::Null => None,
            };
            if let Some(cap) = cap {
                if !engine.supports(cap) {
                    warn!("engine does not support the {}, it will be ignored", kind.role());
                    continue;
                }
            }
            let ns = build_mat_null_space(self.slots.subspace_mut(kind), kind.role(), &self.system)?;
            if let Some(ns) = ns {
                debug!("attached {} of dim {}", kind.role(), ns.dim());
                jac.set_null_space(kind, ns);
            }
        }

        // relative tolerance from the user, the rest at engine defaults
        engine.set_linear_tolerances(LinearTolerances {
            rtol: Some(self.settings.initial_linear_tolerance),
            max_it: Some(self.settings.max_linear_iterations),
            ..LinearTolerances::default()
        });
        engine.set_tolerances(NonlinearTolerances::from(&self.settings));

        // command line options
        engine.set_from_options(&self.options)?;

        match self.slots.presolve.resolve(CallbackRole::PreSolve)? {
            Source::Function(f) => f(&mut self.system),
            Source::Object(o) => o.presolve(&mut self.system),
            Source::Empty => {}
        }

        if let Some(pc) = self.preconditioner.as_deref_mut() {
            pc.set_matrix(jac);
            pc.init()?;
        }

        if let Some(cfg) = self.configuration.as_deref_mut() {
            cfg.configure_solver(&mut *engine)?;
        }

        let state = {
            let mut dispatcher = CallbackDispatcher::new(
                &mut self.system,
                &mut self.slots,
                self.preconditioner.as_deref_mut(),
                self.zero_out_residual,
                self.zero_out_jacobian,
            );
            engine.solve(&mut dispatcher, solution, jac)?;
            dispatcher.state()
        };

        let iterations = engine.iteration_number();
        self.linear_iterations = engine.linear_solve_iterations();

        // constraints were enforced on the local solution during the solve,
        // the distributed solution still needs them
        {
            let mut swapped = SolutionSwap::new(&mut self.system, solution);
            swapped.enforce_constraints_exactly();
        }

        let final_residual_norm = match engine.function_vector() {
            Some(f) => {
                residual.copy_from(f)?;
                f.norm_l2()
            }
            None => residual.norm_l2(),
        };

        self.reason = engine.converged_reason();
        self.converged = self.reason.converged();
        info!("nonlinear solve: {} its, |R| = {:e}, {}", iterations, final_residual_norm, self.reason);

        Ok(SolveResult {
            iterations,
            final_residual_norm,
            converged: self.converged,
            reason: self.reason,
            linear_iterations: self.linear_iterations,
            state,
        })
    }

    /// Solve on the system's own solution vector, then localize it
    pub fn solve_system(&mut self, jac: &mut DistMatrix) -> Result<SolveResult> {
        let n = self.system.n_dofs();
        let mut solution = DistVector::new(n);
        solution.swap(self.system.solution_mut());
        let mut residual = DistVector::new(n);
        let out = self.solve(jac, &mut solution, &mut residual, 0.0, 0);
        self.system.solution_mut().swap(&mut solution);
        self.system.update();
        out
    }

    pub fn print_converged_reason(&self) {
        println!("Nonlinear solver convergence/divergence reason: {}", self.get_converged_reason());
    }

    /// Live from the engine while initialized, otherwise the reason
    /// captured at the end of the last solve
    pub fn get_converged_reason(&self) -> ConvergedReason {
        match self.engine.as_deref() {
            Some(engine) => engine.converged_reason(),
            None => self.reason,
        }
    }

    pub fn get_total_linear_iterations(&self) -> usize {
        self.linear_iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Outer iteration being evaluated, 0 outside a solve
    pub fn get_current_nonlinear_iteration_number(&self) -> usize {
        self.system.current_nonlinear_iteration()
    }

    pub fn set_residual_function<F>(&mut self, f: F)
    where
        F: FnMut(&DistVector, &mut DistVector, &S) + 'a,
    {
        debug!("registered residual function");
        self.slots.residual.set_function(Box::new(f));
    }

    pub fn set_residual_object<O: ComputeResidual<S> + 'a>(&mut self, o: O) {
        debug!("registered residual object");
        self.slots.residual.set_object(Box::new(o));
    }

    pub fn set_jacobian_function<F>(&mut self, f: F)
    where
        F: FnMut(&DistVector, &mut DistMatrix, &S) + 'a,
    {
        debug!("registered jacobian function");
        self.slots.jacobian.set_function(Box::new(f));
    }

    pub fn set_jacobian_object<O: ComputeJacobian<S> + 'a>(&mut self, o: O) {
        debug!("registered jacobian object");
        self.slots.jacobian.set_object(Box::new(o));
    }

    pub fn set_residual_and_jacobian_function<F>(&mut self, f: F)
    where
        F: FnMut(&DistVector, Option<&mut DistVector>, Option<&mut DistMatrix>, &S) + 'a,
    {
        debug!("registered combined residual and jacobian function");
        self.slots.residual_and_jacobian.set_function(Box::new(f));
    }

    pub fn set_residual_and_jacobian_object<O: ComputeResidualAndJacobian<S> + 'a>(&mut self, o: O) {
        debug!("registered combined residual and jacobian object");
        self.slots.residual_and_jacobian.set_object(Box::new(o));
    }

    pub fn set_postcheck_function<F>(&mut self, f: F)
    where
        F: FnMut(&DistVector, &mut DistVector, &mut DistVector, &mut bool, &mut bool, &S) + 'a,
    {
        debug!("registered postcheck function");
        self.slots.postcheck.set_function(Box::new(f));
    }

    pub fn set_postcheck_object<O: ComputePostCheck<S> + 'a>(&mut self, o: O) {
        debug!("registered postcheck object");
        self.slots.postcheck.set_object(Box::new(o));
    }

    pub fn set_nullspace_function<F>(&mut self, kind: NullSpaceKind, f: F)
    where
        F: FnMut(&mut Vec<DistVector>, &S) + 'a,
    {
        debug!("registered {} function", kind.role());
        self.slots.subspace_mut(kind).set_function(Box::new(f));
    }

    pub fn set_nullspace_object<O: ComputeVectorSubspace<S> + 'a>(&mut self, kind: NullSpaceKind, o: O) {
        debug!("registered {} object", kind.role());
        self.slots.subspace_mut(kind).set_object(Box::new(o));
    }

    pub fn set_presolve_function<F: FnMut(&mut S) + 'a>(&mut self, f: F) {
        self.slots.presolve.set_function(Box::new(f));
    }

    pub fn set_presolve_object<O: ComputePreSolve<S> + 'a>(&mut self, o: O) {
        self.slots.presolve.set_object(Box::new(o));
    }

    pub fn attach_preconditioner<P: Preconditioner + 'a>(&mut self, pc: P) {
        self.preconditioner = Some(Box::new(pc));
    }

    pub fn set_solver_configuration<C: SolverConfiguration + 'a>(&mut self, cfg: C) {
        self.configuration = Some(Box::new(cfg));
    }

    pub fn set_options_database(&mut self, db: OptionsDatabase) {
        self.options = db;
    }

    /// Prefix used for the engine created by the next `solve`
    pub fn set_options_prefix(&mut self, prefix: &str) {
        self.prefix = Some(prefix.to_string());
    }

    pub fn set_zero_out_residual(&mut self, flag: bool) {
        self.zero_out_residual = flag;
    }

    pub fn set_zero_out_jacobian(&mut self, flag: bool) {
        self.zero_out_jacobian = flag;
    }

    pub fn use_default_monitor(&mut self, flag: bool) {
        self.default_monitor = flag;
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SolverSettings {
        &mut self.settings
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }
}

impl<'a, S: NonlinearSystem> Drop for NonlinearSolver<'a, S> {
    fn drop(&mut self) {
        self.clear();
    }
}


#[cfg(test)]
mod test_nl_solver {
    use assert_approx_eq::assert_approx_eq;
    use std::cell::Cell;
    use std::rc::Rc;
    use crate::nl_sys::ImplicitSystem;
    use crate::nl_test_common::*;
    use crate::preconditioner::JacobiPreconditioner;
    use super::*;

    fn sqrt2_solver<'a>(with_jac: bool) -> NonlinearSolver<'a, ImplicitSystem> {
        let mut solver = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        solver.set_residual_function(sqrt2_residual);
        if with_jac {
            solver.set_jacobian_function(sqrt2_jacobian);
        }
        solver
    }

    fn run(solver: &mut NonlinearSolver<'_, ImplicitSystem>, x0: f64) -> (Result<SolveResult>, DistVector) {
        let mut jac = DistMatrix::new(1);
        let mut x = DistVector::from_slice(&[x0]);
        let mut r = DistVector::new(1);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0);
        (out, x)
    }

    #[test]
    fn test_sqrt2_with_jacobian() {
        let mut solver = sqrt2_solver(true);
        let (out, x) = run(&mut solver, 1.0);
        let out = out.unwrap();
        assert!(out.converged);
        assert!(out.reason.code() > 0);
        assert!(out.iterations <= 20);
        assert_approx_eq!(x.get(0), 2.0_f64.sqrt(), 1e-6);
        assert!(out.final_residual_norm < 1e-6);
        assert_eq!(out.pair(), (out.iterations, out.final_residual_norm));
        assert_eq!(out.state.jacobian_evaluations, out.iterations);
        assert!(out.linear_iterations >= out.iterations);
        assert_eq!(solver.get_total_linear_iterations(), out.linear_iterations);
        assert!(solver.converged());
        assert!(!solver.is_initialized());
        assert_eq!(solver.get_converged_reason(), out.reason);
    }

    #[test]
    fn test_sqrt2_without_jacobian() {
        let mut solver = sqrt2_solver(false);
        let (out, x) = run(&mut solver, 1.0);
        let out = out.unwrap();
        assert!(out.converged);
        assert!(out.iterations <= 20);
        assert_approx_eq!(x.get(0), 2.0_f64.sqrt(), 1e-6);
        assert_eq!(out.state.jacobian_evaluations, 0);
    }

    #[test]
    fn test_snes_mf_never_calls_jacobian() {
        let jac_calls = Cell::new(0);
        let mut solver = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        solver.set_options_database(OptionsDatabase::from_args(["-snes_mf"]));
        solver.set_residual_function(sqrt2_residual);
        solver.set_jacobian_function(|x: &DistVector, j: &mut DistMatrix, s: &ImplicitSystem| {
            jac_calls.set(jac_calls.get() + 1);
            sqrt2_jacobian(x, j, s);
        });
        let (out, x) = run(&mut solver, 1.0);
        assert!(out.unwrap().converged);
        assert_approx_eq!(x.get(0), 2.0_f64.sqrt(), 1e-6);
        assert_eq!(jac_calls.get(), 0);
    }

    #[test]
    fn test_init_idempotent() {
        let created = Rc::new(Cell::new(0));
        let created_f = created.clone();
        let mut solver = NonlinearSolver::with_engine_factory(
            sqrt2_system(1.0),
            Box::new(move || {
                created_f.set(created_f.get() + 1);
                Box::new(NewtonKrylov::new()) as Box<dyn NonlinearEngine>
            }));
        solver.init(None).unwrap();
        solver.init(Some("again_")).unwrap();
        assert_eq!(created.get(), 1);
        assert!(solver.is_initialized());
        solver.clear();
        assert!(!solver.is_initialized());
        solver.clear();
        solver.init(None).unwrap();
        assert_eq!(created.get(), 2);
    }

    #[test]
    fn test_unable_to_compute_clears() {
        let mut solver: NonlinearSolver<'_, ImplicitSystem> = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(matches!(out, Err(SolverError::UnableToCompute)));
        assert!(!solver.is_initialized());
    }

    #[test]
    fn test_both_supplied_residual() {
        let mut solver = sqrt2_solver(true);
        solver.set_residual_object(ConstrainedResidual);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(matches!(out, Err(SolverError::BothSupplied(CallbackRole::Residual))));
        assert!(!solver.is_initialized());
    }

    #[test]
    fn test_failed_solve_resets_verdict() {
        let mut solver = sqrt2_solver(true);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(out.unwrap().converged);
        assert!(solver.converged());

        solver.set_residual_object(ConstrainedResidual);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(out.is_err());
        assert!(!solver.converged());
        assert_eq!(solver.get_converged_reason(), ConvergedReason::ConvergedIterating);
        assert_eq!(solver.get_total_linear_iterations(), 0);
    }

    #[test]
    fn test_singular_start_reports_linear_failure() {
        let mut solver = sqrt2_solver(true);
        let (out, x) = run(&mut solver, 0.0);
        let out = out.unwrap();
        assert!(!out.converged);
        assert_eq!(out.reason, ConvergedReason::DivergedLinearSolve);
        assert_eq!(x.get(0), 0.0);
    }

    #[test]
    fn test_nl_step_line() {
        assert_eq!(nl_step_line(0, 1.0), "  NL step  0, |residual|_2 = 1.000000e0");
        assert_eq!(nl_step_line(12, 2.5e-9), "  NL step 12, |residual|_2 = 2.500000e-9");
    }

    #[test]
    fn test_both_supplied_jacobian() {
        let mut solver = sqrt2_solver(true);
        solver.set_jacobian_object(ConstrainedJacobian);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(matches!(out, Err(SolverError::BothSupplied(CallbackRole::Jacobian))));
    }

    #[test]
    fn test_both_supplied_presolve() {
        struct Noop;
        impl ComputePreSolve<ImplicitSystem> for Noop {
            fn presolve(&mut self, _sys: &mut ImplicitSystem) {}
        }
        let mut solver = sqrt2_solver(true);
        solver.set_presolve_object(Noop);
        solver.set_presolve_function(|_s: &mut ImplicitSystem| {});
        let (out, _x) = run(&mut solver, 1.0);
        assert!(matches!(out, Err(SolverError::BothSupplied(CallbackRole::PreSolve))));
    }

    #[test]
    fn test_both_supplied_nullspaces() {
        struct Modes;
        impl ComputeVectorSubspace<ImplicitSystem> for Modes {
            fn compute(&mut self, sp: &mut Vec<DistVector>, _sys: &ImplicitSystem) {
                sp.push(DistVector::from_slice(&[1.0]));
            }
        }
        for kind in [NullSpaceKind::Null, NullSpaceKind::Transpose, NullSpaceKind::Near] {
            let mut solver = sqrt2_solver(true);
            solver.set_nullspace_object(kind, Modes);
            solver.set_nullspace_function(kind, |_sp: &mut Vec<DistVector>, _s: &ImplicitSystem| {});
            let (out, _x) = run(&mut solver, 1.0);
            match out {
                Err(SolverError::BothSupplied(role)) => assert_eq!(role, kind.role()),
                _ => panic!("expected BothSupplied for {}", kind.role()),
            }
        }
    }

    #[test]
    fn test_both_supplied_postcheck() {
        struct Noop;
        impl ComputePostCheck<ImplicitSystem> for Noop {
            fn postcheck(&mut self, _x: &DistVector, _y: &mut DistVector, _w: &mut DistVector,
                         _cy: &mut bool, _cw: &mut bool, _sys: &ImplicitSystem) {}
        }
        let mut solver = sqrt2_solver(true);
        solver.set_postcheck_object(Noop);
        solver.set_postcheck_function(
            |_x: &DistVector, _y: &mut DistVector, _w: &mut DistVector, _cy: &mut bool, _cw: &mut bool, _s: &ImplicitSystem| {});
        let (out, _x) = run(&mut solver, 1.0);
        assert!(matches!(out, Err(SolverError::BothSupplied(CallbackRole::PostCheck))));
    }

    #[test]
    fn test_combined_function() {
        let mut solver = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        solver.set_residual_and_jacobian_function(
            |x: &DistVector, r: Option<&mut DistVector>, jac: Option<&mut DistMatrix>, _s: &ImplicitSystem| {
                if let Some(r) = r {
                    r.set(0, x.get(0) * x.get(0) - 2.0);
                }
                if let Some(jac) = jac {
                    jac.set(0, 0, 2.0 * x.get(0));
                }
            });
        let (out, x) = run(&mut solver, 3.0);
        let out = out.unwrap();
        assert!(out.converged);
        assert!(out.state.jacobian_evaluations > 0);
        assert_approx_eq!(x.get(0), 2.0_f64.sqrt(), 1e-6);
    }

    #[test]
    fn test_zeroing_flags() {
        // residual callbacks add into r, without zeroing the stale value
        // from the previous evaluation leaks in
        let mut solver = sqrt2_solver(true);
        solver.set_zero_out_residual(false);
        solver.settings_mut().max_nonlinear_iterations = 3;
        let (out, _x) = run(&mut solver, 1.0);
        let out = out.unwrap();
        assert!(!out.converged);

        let mut solver = sqrt2_solver(true);
        let (out, _x) = run(&mut solver, 1.0);
        assert!(out.unwrap().converged);
    }

    #[test]
    fn test_iteration_index_visible() {
        let seen = std::cell::RefCell::new(Vec::new());
        let mut solver = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        solver.set_residual_function(|x: &DistVector, r: &mut DistVector, s: &ImplicitSystem| {
            seen.borrow_mut().push(s.current_nonlinear_iteration());
            sqrt2_residual(x, r, s);
        });
        solver.set_jacobian_function(sqrt2_jacobian);
        let (out, _x) = run(&mut solver, 1.0);
        let out = out.unwrap();
        let seen = seen.borrow();
        assert_eq!(seen[0], 0);
        assert_eq!(*seen.iter().max().unwrap(), out.iterations - 1);
        assert_eq!(out.state.residual_evaluations, seen.len());
        assert_eq!(solver.get_current_nonlinear_iteration_number(), 0);
    }

    #[test]
    fn test_settings_drive_engine() {
        let mut solver = sqrt2_solver(true);
        solver.settings_mut().max_nonlinear_iterations = 1;
        let (out, _x) = run(&mut solver, 100.0);
        let out = out.unwrap();
        assert_eq!(out.iterations, 1);
        assert_eq!(out.reason, ConvergedReason::DivergedMaxIts);
        assert!(!out.converged);
        assert!(!solver.converged());
    }

    #[test]
    fn test_options_prefix_scoping() {
        let db = OptionsDatabase::from_args(["-sys1_snes_max_it", "1", "-sys2_snes_max_it", "7"]);
        let mut solver = sqrt2_solver(true);
        solver.set_options_database(db.clone());
        solver.set_options_prefix("sys1_");
        let (out, _x) = run(&mut solver, 100.0);
        assert_eq!(out.unwrap().iterations, 1);

        let mut solver = sqrt2_solver(true);
        solver.set_options_database(db);
        let (out, _x) = run(&mut solver, 100.0);
        assert!(out.unwrap().iterations > 1);
    }

    struct CapIts {
        max_it: usize,
        init_calls: Rc<Cell<usize>>,
    }

    impl SolverConfiguration for CapIts {
        fn set_options_during_init(&mut self, _engine: &mut dyn NonlinearEngine) -> Result<()> {
            self.init_calls.set(self.init_calls.get() + 1);
            Ok(())
        }

        fn configure_solver(&mut self, engine: &mut dyn NonlinearEngine) -> Result<()> {
            let mut tol = engine.tolerances();
            tol.max_it = self.max_it;
            engine.set_tolerances(tol);
            Ok(())
        }
    }

    #[test]
    fn test_configuration_overrides_options() {
        let init_calls = Rc::new(Cell::new(0));
        let mut solver = sqrt2_solver(true);
        solver.settings_mut().max_nonlinear_iterations = 30;
        solver.set_options_database(OptionsDatabase::from_args(["-snes_max_it", "20"]));
        solver.set_solver_configuration(CapIts { max_it: 2, init_calls: init_calls.clone() });
        let (out, _x) = run(&mut solver, 100.0);
        assert_eq!(out.unwrap().iterations, 2);
        assert_eq!(init_calls.get(), 1);
    }

    #[test]
    fn test_presolve_runs_before_residual() {
        let order = std::cell::RefCell::new(Vec::new());
        let mut solver = NonlinearSolver::new(sqrt2_system(1.0));
        solver.use_default_monitor(false);
        solver.set_presolve_function(|_s: &mut ImplicitSystem| order.borrow_mut().push("presolve"));
        solver.set_residual_function(|x: &DistVector, r: &mut DistVector, s: &ImplicitSystem| {
            order.borrow_mut().push("residual");
            sqrt2_residual(x, r, s);
        });
        let (out, _x) = run(&mut solver, 1.0);
        out.unwrap();
        let order = order.borrow();
        assert_eq!(order[0], "presolve");
        assert_eq!(order.iter().filter(|s| **s == "presolve").count(), 1);
        assert!(order.len() > 1);
    }

    #[test]
    fn test_transpose_null_space_unsupported() {
        let called = Cell::new(false);
        let mut solver = NonlinearSolver::with_engine_factory(
            sqrt2_system(1.0),
            Box::new(|| Box::new(NewtonKrylov::with_capabilities(&[])) as Box<dyn NonlinearEngine>));
        solver.use_default_monitor(false);
        solver.set_residual_function(sqrt2_residual);
        solver.set_jacobian_function(sqrt2_jacobian);
        solver.set_nullspace_function(NullSpaceKind::Transpose, |_sp: &mut Vec<DistVector>, _s: &ImplicitSystem| {
            called.set(true);
        });
        let mut jac = DistMatrix::new(1);
        let mut x = DistVector::from_slice(&[1.0]);
        let mut r = DistVector::new(1);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0).unwrap();
        assert!(out.converged);
        assert!(!called.get());
        assert!(jac.null_space(NullSpaceKind::Transpose).is_none());
    }

    #[test]
    fn test_null_space_attached() {
        // F(x) = [x0 + x1 - 2, x0 + x1 - 2] is singular along (1, -1)
        let mut solver = NonlinearSolver::new(ImplicitSystem::new("singular", 2));
        solver.use_default_monitor(false);
        solver.set_residual_function(|x: &DistVector, r: &mut DistVector, _s: &ImplicitSystem| {
            let v = x.get(0) + x.get(1) - 2.0;
            r.set(0, v);
            r.set(1, v);
        });
        solver.set_jacobian_function(|_x: &DistVector, j: &mut DistMatrix, _s: &ImplicitSystem| {
            for i in 0..2 {
                for k in 0..2 {
                    j.set(i, k, 1.0);
                }
            }
        });
        solver.set_nullspace_function(NullSpaceKind::Null, |sp: &mut Vec<DistVector>, _s: &ImplicitSystem| {
            sp.push(DistVector::from_slice(&[1.0, -1.0]));
        });
        solver.set_nullspace_function(NullSpaceKind::Transpose, |sp: &mut Vec<DistVector>, _s: &ImplicitSystem| {
            sp.push(DistVector::from_slice(&[1.0, -1.0]));
        });
        let mut jac = DistMatrix::new(2);
        let mut x = DistVector::from_slice(&[3.0, 1.0]);
        let mut r = DistVector::new(2);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0).unwrap();
        assert!(out.converged);
        assert_approx_eq!(x.get(0) + x.get(1), 2.0, 1e-10);
        // the step carried no null space component
        assert_approx_eq!(x.get(0) - x.get(1), 2.0, 1e-10);
        let ns = jac.null_space(NullSpaceKind::Null).unwrap();
        assert_approx_eq!(ns.vectors()[0].norm_l2(), 1.0, 1e-14);
    }

    #[test]
    fn test_constraints_on_returned_solution() {
        let mut solver = NonlinearSolver::new(constrained_system());
        solver.use_default_monitor(false);
        solver.set_residual_object(ConstrainedResidual);
        solver.set_jacobian_object(ConstrainedJacobian);
        let mut jac = DistMatrix::new(3);
        let mut x = DistVector::from_slice(&[2.0, 3.0, 0.0]);
        let mut r = DistVector::new(3);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0).unwrap();
        assert!(out.converged);
        assert_approx_eq!(x.get(0), 1.0, 1e-6);
        assert_approx_eq!(x.get(1), 2.0, 1e-6);
        assert_approx_eq!(x.get(2), 0.5 * (x.get(0) + x.get(1)), 1e-14);
        assert_approx_eq!(r.norm_l2(), out.final_residual_norm, 1e-15);
    }

    #[test]
    fn test_postcheck_with_constraints_reevaluates() {
        let mut solver = NonlinearSolver::new(constrained_system());
        solver.use_default_monitor(false);
        solver.set_residual_object(ConstrainedResidual);
        solver.set_jacobian_object(ConstrainedJacobian);
        solver.set_postcheck_function(
            |_x: &DistVector, _y: &mut DistVector, _w: &mut DistVector, _cy: &mut bool, _cw: &mut bool, _s: &ImplicitSystem| {});
        let mut jac = DistMatrix::new(3);
        let mut x = DistVector::from_slice(&[2.0, 3.0, 0.0]);
        let mut r = DistVector::new(3);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0).unwrap();
        assert!(out.converged);
        assert_eq!(out.state.postcheck_calls, out.iterations);
        // every step evaluates the line search point and the constrained one
        assert!(out.state.residual_evaluations >= 1 + 2 * out.iterations);
    }

    #[test]
    fn test_solve_system_with_preconditioner() {
        let mut solver = NonlinearSolver::new(constrained_system());
        solver.use_default_monitor(false);
        solver.attach_preconditioner(JacobiPreconditioner::new());
        solver.set_residual_object(ConstrainedResidual);
        solver.set_jacobian_object(ConstrainedJacobian);
        {
            let sol = solver.system_mut().solution_mut();
            sol.set(0, 2.0);
            sol.set(1, 3.0);
            sol.close();
        }
        let mut jac = DistMatrix::new(3);
        let out = solver.solve_system(&mut jac).unwrap();
        assert!(out.converged);
        let sys = solver.system();
        assert_approx_eq!(sys.solution().get(1), 2.0, 1e-6);
        assert_approx_eq!(sys.current_local_solution().get(2), 0.5 * (sys.solution().get(0) + 2.0), 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut solver = sqrt2_solver(true);
        let mut jac = DistMatrix::new(1);
        let mut x = DistVector::from_slice(&[1.0, 2.0]);
        let mut r = DistVector::new(1);
        let out = solver.solve(&mut jac, &mut x, &mut r, 0.0, 0);
        assert!(matches!(out, Err(SolverError::DimensionMismatch { expected: 1, actual: 2 })));
    }
}
