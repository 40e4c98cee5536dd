#![allow(dead_code)]

pub mod assertions;
pub mod logging;

pub use assertions::{assert_contains, assert_path_exists};
pub use logging::init_test_logging;
