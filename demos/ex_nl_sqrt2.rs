/// Demo solving x*x - 2 = 0 through the nonlinear solver adapter, once with
/// an analytic Jacobian and once matrix free.
///
/// Extra command line arguments go to the options database, for example
///   cargo run --example ex_nl_sqrt2 -- -snes_linesearch_type basic
use femsnes::dist_mat::DistMatrix;
use femsnes::dist_vec::DistVector;
use femsnes::nl_solver::NonlinearSolver;
use femsnes::nl_sys::{ImplicitSystem, NonlinearSystem};
use femsnes::options::OptionsDatabase;


fn residual(x: &DistVector, r: &mut DistVector, _sys: &ImplicitSystem) {
    r.set(0, x.get(0) * x.get(0) - 2.0);
}

fn jacobian(x: &DistVector, jac: &mut DistMatrix, _sys: &ImplicitSystem) {
    jac.set(0, 0, 2.0 * x.get(0));
}


pub fn main() {
    let options = OptionsDatabase::from_args(std::env::args().skip(1));

    for with_jac in [true, false] {
        let mut sys = ImplicitSystem::new("sqrt2", 1);
        sys.solution_mut().set(0, 1.0);
        sys.solution_mut().close();

        let mut solver = NonlinearSolver::new(sys);
        solver.set_options_database(options.clone());
        solver.set_residual_function(residual);
        if with_jac {
            solver.set_jacobian_function(jacobian);
        }

        let mut jac = DistMatrix::new(1);
        println!("jacobian: {}", if with_jac { "analytic" } else { "matrix free" });
        match solver.solve_system(&mut jac) {
            Ok(res) => {
                solver.print_converged_reason();
                let (its, fnorm) = res.pair();
                println!("x = {:.12}, its = {}, |R| = {:e}, linear its = {}",
                         solver.system().solution().get(0), its, fnorm, res.linear_iterations);
            }
            Err(e) => println!("solve failed: {}", e),
        }
    }
}
