pub mod case_loader;

pub use case_loader::{load_problem_cases, load_test_cases, TestCaseStore};
