pub mod error;
pub mod dist_vec;
pub mod dist_mat;
pub mod dof_map;
pub mod nl_sys;
pub mod nl_callbacks;
pub mod null_space;
pub mod options;
pub mod preconditioner;
pub mod nl_engine;
pub mod newton;
pub mod nl_dispatch;
pub mod nl_solver;
// for testing only
pub mod nl_test_common;
