//! Log output for the command-line tool.

mod tracing_init;

pub use tracing_init::*;
