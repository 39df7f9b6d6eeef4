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
/// Newtons method with line search and a krylov inner solve.
///
/// Reference `NonlinearEngine`.  Solves R(x)=0 for x.
/// Iterates
///
///   J(x_k) * y = R(x_k)
///   x_k+1 = x_k - lambda * y
///
/// with lambda from the line search.  When no Jacobian callback is
/// registered the action of J on a vector is approximated by differencing
/// the residual.
use std::cell::RefCell;
use std::fmt;
use faer::prelude::*;
use faer::linop::LinOp;
use faer::dyn_stack::{PodStack, SizeOverflow, StackReq};
use faer::Parallelism;
use faer_gmres::gmres;
use log::debug;
use crate::dist_mat::DistMatrix;
use crate::dist_vec::DistVector;
use crate::error::{Result, SolverError};
use crate::nl_engine::*;
use crate::null_space::NullSpaceKind;
use crate::options::OptionsDatabase;


/// Sufficient decrease constant of the backtracking line search
const BT_ALPHA: f64 = 1e-4;
/// Step halvings before the line search gives up
const BT_MAX_HALVINGS: usize = 10;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchType {
    /// Full newton step
    Basic,
    /// Backtracking on |F|
    Bt,
}


/// Inner linear solve settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KspParams {
    /// Relative decrease of the linear residual
    pub rtol: f64,
    pub atol: f64,
    /// Divergence tolerance, relative to |b|
    pub dtol: f64,
    pub max_it: usize,
}

impl Default for KspParams {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-50,
            dtol: 1e5,
            max_it: 10000,
        }
    }
}


/// Result of one inner linear solve.  `residual_norm` is the true
/// residual |b - J y|, not the krylov estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSolveOutcome {
    /// Operator applications made by gmres
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
    /// No reduction of the residual, a non finite step or growth past dtol
    pub diverged: bool,
}


struct CallbackCtx<'c> {
    cb: &'c mut dyn EngineCallbacks,
    its: usize,
    n_fevals: usize,
    n_applies: usize,
    err: Option<SolverError>,
}

/// Engine callbacks shared by the jacobian and preconditioner operators of
/// one linear solve.  `LinOp::apply` only gets `&self`.
struct CallbackCell<'c> {
    inner: RefCell<CallbackCtx<'c>>,
}

// SAFETY: gmres applies its operators one column at a time from the calling
// thread, the cell is never reached from two threads at once.
unsafe impl Sync for CallbackCell<'_> {}

impl<'c> CallbackCell<'c> {
    fn new(cb: &'c mut dyn EngineCallbacks, its: usize) -> Self {
        Self {
            inner: RefCell::new(CallbackCtx { cb, its, n_fevals: 0, n_applies: 0, err: None }),
        }
    }

    /// Keep the first failure, gmres has no way to stop on it
    fn record(&self, e: SolverError) {
        let mut ctx = self.inner.borrow_mut();
        if ctx.err.is_none() {
            ctx.err = Some(e);
        }
    }

    fn take_error(&self) -> Result<()> {
        match self.inner.borrow_mut().err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn applies(&self) -> usize {
        self.inner.borrow().n_applies
    }

    fn function_evaluations(&self) -> usize {
        self.inner.borrow().n_fevals
    }
}


/// Jacobian seen by the linear solve: either the assembled matrix or a
/// finite difference of the residual around x
struct NewtonOperator<'s, 'c> {
    ctx: &'s CallbackCell<'c>,
    jac: &'s DistMatrix,
    x: &'s DistVector,
    fx: &'s DistVector,
    assembled: bool,
}

impl<'s, 'c> NewtonOperator<'s, 'c> {
    /// J v
    fn apply_vec(&self, v: &DistVector) -> Result<DistVector> {
        let mut out = v.duplicate();
        if self.assembled {
            self.jac.mult(v, &mut out)?;
            return Ok(out);
        }
        let v_norm = v.norm_l2();
        if v_norm == 0.0 {
            return Ok(out);
        }
        let eps = 0.5e-8 * (1.0 + self.x.norm_max()) / v_norm;
        let mut x_pert = self.x.clone();
        x_pert.axpy(eps, v);
        let mut ctx = self.ctx.inner.borrow_mut();
        let its = ctx.its;
        ctx.cb.residual(its, &mut x_pert, &mut out)?;
        ctx.n_fevals += 1;
        // (F(x + eps v) - F(x)) / eps
        out.axpy(-1.0, self.fx);
        out.scale(1.0 / eps);
        Ok(out)
    }
}

impl<'s, 'c> fmt::Debug for NewtonOperator<'s, 'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NewtonOperator(n={}, assembled={})", self.x.len(), self.assembled)
    }
}

impl<'s, 'c> LinOp<f64> for NewtonOperator<'s, 'c> {
    fn apply_req(
            &self,
            rhs_ncols: usize,
            parallelism: Parallelism,
        ) -> core::result::Result<StackReq, SizeOverflow> {
        let _ = parallelism;
        let _ = rhs_ncols;
        Ok(StackReq::empty())
    }

    fn nrows(&self) -> usize {
        self.x.len()
    }

    fn ncols(&self) -> usize {
        self.x.len()
    }

    /// out = J * rhs, column by column.  Callback failures are kept in the
    /// shared cell and `out` is zeroed.
    fn apply(
        &self,
        mut out: MatMut<f64>,
        rhs: MatRef<f64>,
        parallelism: Parallelism,
        stack: &mut PodStack,
        )
    {
        // unused
        _ = parallelism;
        _ = stack;

        self.ctx.inner.borrow_mut().n_applies += 1;
        for j in 0..rhs.ncols() {
            let v = DistVector::from_mat(rhs.subcols(j, 1));
            match self.apply_vec(&v) {
                Ok(jv) => out.as_mut().subcols_mut(j, 1).copy_from(jv.as_mat()),
                Err(e) => {
                    self.ctx.record(e);
                    out.fill_zero();
                    return;
                }
            }
        }
    }

    /// Real operator, same as `apply`
    fn conj_apply(
            &self,
            out: MatMut<'_, f64>,
            rhs: MatRef<'_, f64>,
            parallelism: Parallelism,
            stack: &mut PodStack,
        ) {
        self.apply(out, rhs, parallelism, stack)
    }
}


/// Shell preconditioner forwarded to `EngineCallbacks::pc_apply`
struct ShellPcOperator<'s, 'c> {
    ctx: &'s CallbackCell<'c>,
    n: usize,
}

impl<'s, 'c> fmt::Debug for ShellPcOperator<'s, 'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShellPcOperator(n={})", self.n)
    }
}

impl<'s, 'c> LinOp<f64> for ShellPcOperator<'s, 'c> {
    fn apply_req(
            &self,
            rhs_ncols: usize,
            parallelism: Parallelism,
        ) -> core::result::Result<StackReq, SizeOverflow> {
        let _ = parallelism;
        let _ = rhs_ncols;
        Ok(StackReq::empty())
    }

    fn nrows(&self) -> usize {
        self.n
    }

    fn ncols(&self) -> usize {
        self.n
    }

    fn apply(
        &self,
        mut out: MatMut<f64>,
        rhs: MatRef<f64>,
        parallelism: Parallelism,
        stack: &mut PodStack,
        )
    {
        _ = parallelism;
        _ = stack;

        for j in 0..rhs.ncols() {
            let v = DistVector::from_mat(rhs.subcols(j, 1));
            let mut mv = v.duplicate();
            let applied = self.ctx.inner.borrow_mut().cb.pc_apply(&v, &mut mv);
            match applied {
                Ok(()) => out.as_mut().subcols_mut(j, 1).copy_from(mv.as_mat()),
                Err(e) => {
                    self.ctx.record(e);
                    out.fill_zero();
                    return;
                }
            }
        }
    }

    fn conj_apply(
            &self,
            out: MatMut<'_, f64>,
            rhs: MatRef<'_, f64>,
            parallelism: Parallelism,
            stack: &mut PodStack,
        ) {
        self.apply(out, rhs, parallelism, stack)
    }
}


/// Solve J y = b with gmres, then check the true residual.
///
/// The krylov space can not grow past the problem size, so the iteration
/// cap is clipped to it.
fn krylov_solve(
    op: &NewtonOperator,
    pc: Option<&dyn LinOp<f64>>,
    b: &DistVector,
    y: &mut DistVector,
    params: &KspParams,
) -> Result<LinearSolveOutcome>
{
    y.check_len(b)?;
    let bnorm = b.norm_l2();
    if bnorm == 0.0 {
        y.zero();
        return Ok(LinearSolveOutcome { iterations: 0, residual_norm: 0.0, converged: true, diverged: false });
    }
    let max_it = params.max_it.min(b.len()).max(1);
    let applies0 = op.ctx.applies();

    let mut sol: Mat<f64> = Mat::zeros(b.len(), 1);
    match gmres(op, b.as_mat(), sol.as_mut(), max_it, params.rtol, pc) {
        Ok((err, iters)) => debug!("gmres: {} its, err = {:e}", iters, err),
        Err(e) => debug!("gmres stopped short of rtol: {:?}", e),
    }
    op.ctx.take_error()?;
    let iterations = op.ctx.applies() - applies0;
    *y = DistVector::from_mat(sol.as_ref());

    // r = b - J y
    let mut r = op.apply_vec(y)?;
    r.scale(-1.0);
    r.axpy(1.0, b);
    let rnorm = r.norm_l2();
    Ok(LinearSolveOutcome {
        iterations,
        residual_norm: rnorm,
        converged: rnorm <= (params.rtol * bnorm).max(params.atol),
        diverged: !rnorm.is_finite() || rnorm >= bnorm || rnorm > params.dtol * bnorm,
    })
}


/// Newton-Krylov engine
pub struct NewtonKrylov {
    prefix: Option<String>,
    monitor: Option<Box<dyn FnMut(usize, f64)>>,
    fvec: Option<DistVector>,
    has_jacobian: bool,
    has_post_check: bool,
    shell_pc: bool,
    matrix_free: bool,
    line_search: LineSearchType,
    tol: NonlinearTolerances,
    linear: KspParams,
    capabilities: Vec<EngineCapability>,
    its: usize,
    linear_its: usize,
    n_fevals: usize,
    reason: ConvergedReason,
}

impl Default for NewtonKrylov {
    fn default() -> Self {
        Self::new()
    }
}

impl NewtonKrylov {
    pub fn new() -> Self {
        Self::with_capabilities(&[EngineCapability::TransposeNullSpace, EngineCapability::NearNullSpace])
    }

    pub fn with_capabilities(caps: &[EngineCapability]) -> Self {
        Self {
            prefix: None,
            monitor: None,
            fvec: None,
            has_jacobian: false,
            has_post_check: false,
            shell_pc: false,
            matrix_free: false,
            line_search: LineSearchType::Bt,
            tol: NonlinearTolerances::default(),
            linear: KspParams::default(),
            capabilities: caps.to_vec(),
            its: 0,
            linear_its: 0,
            n_fevals: 0,
            reason: ConvergedReason::ConvergedIterating,
        }
    }

    pub fn line_search(&self) -> LineSearchType {
        self.line_search
    }

    pub fn set_line_search(&mut self, ls: LineSearchType) {
        self.line_search = ls;
    }

    pub fn linear_params(&self) -> &KspParams {
        &self.linear
    }

    /// Residual evaluations in the last solve, differenced ones included
    pub fn function_evaluations(&self) -> usize {
        self.n_fevals
    }

    pub fn is_matrix_free(&self) -> bool {
        self.matrix_free
    }

    fn monitor(&mut self, its: usize, fnorm: f64) {
        if let Some(m) = self.monitor.as_mut() {
            m(its, fnorm);
        }
    }

    /// Convergence test after a step, in order NaN, absolute, function
    /// count, relative, step
    fn converged_test(&self, fnorm: f64, ttol: f64, snorm: f64, xnorm: f64) -> ConvergedReason {
        if fnorm.is_nan() {
            ConvergedReason::DivergedFnormNan
        } else if fnorm < self.tol.atol {
            ConvergedReason::ConvergedFnormAbs
        } else if self.n_fevals >= self.tol.max_funcs {
            ConvergedReason::DivergedFunctionCount
        } else if fnorm <= ttol {
            ConvergedReason::ConvergedFnormRelative
        } else if snorm < self.tol.stol * xnorm {
            ConvergedReason::ConvergedSnormRelative
        } else {
            ConvergedReason::ConvergedIterating
        }
    }

    fn iterate(
        &mut self,
        cb: &mut dyn EngineCallbacks,
        x: &mut DistVector,
        jac: &mut DistMatrix,
        f: &mut DistVector,
    ) -> Result<()>
    {
        cb.residual(0, x, f)?;
        self.n_fevals += 1;
        let mut fnorm = f.norm_l2();
        self.monitor(0, fnorm);
        if fnorm.is_nan() {
            self.reason = ConvergedReason::DivergedFnormNan;
            return Ok(());
        }
        if fnorm < self.tol.atol {
            self.reason = ConvergedReason::ConvergedFnormAbs;
            return Ok(());
        }
        let ttol = fnorm * self.tol.rtol;
        let assembled = self.has_jacobian && !self.matrix_free;

        let mut y = x.duplicate();
        let mut w = x.duplicate();
        let mut g = f.duplicate();
        for it in 0..self.tol.max_it {
            if assembled {
                cb.jacobian(it, x, jac, None)?;
            }
            if self.shell_pc {
                cb.pc_setup(jac)?;
            }

            // solve J * y = F(x_k) for y
            let mut rhs = f.clone();
            if let Some(tns) = jac.null_space(NullSpaceKind::Transpose) {
                tns.remove_from(&mut rhs);
            }
            let outcome = {
                let ctx = CallbackCell::new(&mut *cb, it);
                let op = NewtonOperator {
                    ctx: &ctx,
                    jac: &*jac,
                    x: &*x,
                    fx: &*f,
                    assembled,
                };
                let shell = ShellPcOperator { ctx: &ctx, n: x.len() };
                let pc: Option<&dyn LinOp<f64>> = if self.shell_pc { Some(&shell) } else { None };
                let outcome = krylov_solve(&op, pc, &rhs, &mut y, &self.linear);
                self.n_fevals += ctx.function_evaluations();
                outcome?
            };
            self.linear_its += outcome.iterations;
            if outcome.diverged {
                debug!("linear solve failed at step {}: |r| = {:e}", it, outcome.residual_norm);
                self.reason = ConvergedReason::DivergedLinearSolve;
                return Ok(());
            }
            if let Some(ns) = jac.null_space(NullSpaceKind::Null) {
                ns.remove_from(&mut y);
            }
            let ynorm = y.norm_l2();

            // line search: w = x - lambda * y
            let mut lambda = 1.0;
            let mut gnorm;
            let mut halvings = 0;
            loop {
                w.copy_from(x)?;
                w.axpy(-lambda, &y);
                cb.residual(it, &mut w, &mut g)?;
                self.n_fevals += 1;
                gnorm = g.norm_l2();
                if self.line_search == LineSearchType::Basic
                    || gnorm <= (1.0 - BT_ALPHA * lambda) * fnorm
                {
                    break;
                }
                if halvings == BT_MAX_HALVINGS {
                    debug!("line search failed at step {}: |F| = {:e}", it, gnorm);
                    self.reason = ConvergedReason::DivergedLineSearch;
                    return Ok(());
                }
                lambda *= 0.5;
                halvings += 1;
            }

            if self.has_post_check {
                let flags = cb.postcheck(x, &mut y, &mut w)?;
                if flags.changed_w {
                    cb.residual(it, &mut w, &mut g)?;
                    self.n_fevals += 1;
                    gnorm = g.norm_l2();
                }
            }

            x.copy_from(&w)?;
            f.copy_from(&g)?;
            fnorm = gnorm;
            self.its = it + 1;
            self.monitor(self.its, fnorm);

            let reason = self.converged_test(fnorm, ttol, lambda * ynorm, x.norm_l2());
            if reason != ConvergedReason::ConvergedIterating {
                self.reason = reason;
                return Ok(());
            }
        }
        self.reason = ConvergedReason::DivergedMaxIts;
        Ok(())
    }
}

impl NonlinearEngine for NewtonKrylov {
    fn set_options_prefix(&mut self, prefix: &str) {
        self.prefix = Some(prefix.to_string());
    }

    fn options_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn monitor_set(&mut self, monitor: Box<dyn FnMut(usize, f64)>) {
        self.monitor = Some(monitor);
    }

    fn set_function(&mut self, r: DistVector) {
        self.fvec = Some(r);
    }

    fn set_jacobian(&mut self) {
        self.has_jacobian = true;
    }

    fn set_post_check(&mut self) {
        self.has_post_check = true;
    }

    fn set_shell_preconditioner(&mut self) {
        self.shell_pc = true;
    }

    fn set_tolerances(&mut self, tol: NonlinearTolerances) {
        self.tol = tol;
    }

    fn tolerances(&self) -> NonlinearTolerances {
        self.tol
    }

    fn set_linear_tolerances(&mut self, tol: LinearTolerances) {
        if let Some(rtol) = tol.rtol {
            self.linear.rtol = rtol;
        }
        if let Some(atol) = tol.atol {
            self.linear.atol = atol;
        }
        if let Some(dtol) = tol.dtol {
            self.linear.dtol = dtol;
        }
        if let Some(max_it) = tol.max_it {
            self.linear.max_it = max_it;
        }
    }

    fn set_from_options(&mut self, db: &OptionsDatabase) -> Result<()> {
        let p = self.prefix.clone();
        let p = p.as_deref();
        if let Some(v) = db.get_f64(p, "snes_atol")? { self.tol.atol = v; }
        if let Some(v) = db.get_f64(p, "snes_rtol")? { self.tol.rtol = v; }
        if let Some(v) = db.get_f64(p, "snes_stol")? { self.tol.stol = v; }
        if let Some(v) = db.get_usize(p, "snes_max_it")? { self.tol.max_it = v; }
        if let Some(v) = db.get_usize(p, "snes_max_funcs")? { self.tol.max_funcs = v; }
        if let Some(v) = db.get_bool(p, "snes_mf")? { self.matrix_free = v; }
        if let Some(v) = db.get_str(p, "snes_linesearch_type") {
            self.line_search = match v {
                "basic" => LineSearchType::Basic,
                "bt" => LineSearchType::Bt,
                _ => return Err(SolverError::InvalidOption {
                    name: format!("{}snes_linesearch_type", p.unwrap_or("")),
                    value: v.to_string(),
                }),
            };
        }
        self.set_linear_tolerances(LinearTolerances {
            rtol: db.get_f64(p, "ksp_rtol")?,
            atol: db.get_f64(p, "ksp_atol")?,
            dtol: db.get_f64(p, "ksp_divtol")?,
            max_it: db.get_usize(p, "ksp_max_it")?,
        });
        Ok(())
    }

    fn supports(&self, cap: EngineCapability) -> bool {
        self.capabilities.contains(&cap)
    }

    fn solve(
        &mut self,
        cb: &mut dyn EngineCallbacks,
        x: &mut DistVector,
        jac: &mut DistMatrix,
    ) -> Result<()>
    {
        self.its = 0;
        self.linear_its = 0;
        self.n_fevals = 0;
        self.reason = ConvergedReason::ConvergedIterating;

        let mut f = self.fvec.take()
            .ok_or_else(|| SolverError::engine(73, "residual function not set"))?;
        if f.len() != x.len() {
            let err = SolverError::DimensionMismatch { expected: x.len(), actual: f.len() };
            self.fvec = Some(f);
            return Err(err);
        }
        let out = self.iterate(cb, x, jac, &mut f);
        self.fvec = Some(f);
        debug!("newton finished: its = {}, linear its = {}, reason = {}",
               self.its, self.linear_its, self.reason);
        out
    }

    fn iteration_number(&self) -> usize {
        self.its
    }

    fn linear_solve_iterations(&self) -> usize {
        self.linear_its
    }

    fn converged_reason(&self) -> ConvergedReason {
        self.reason
    }

    fn function_vector(&self) -> Option<&DistVector> {
        self.fvec.as_ref()
    }
}
