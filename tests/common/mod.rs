//! Shared test support: the scripted moray fake and fixture builders.

// Not every test binary exercises every fixture.
#![allow(dead_code)]

pub mod fixtures;
pub mod mocks;

/// Route crate logs to the test output when `RUST_LOG` is set.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
