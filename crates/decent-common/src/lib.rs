//! Shared pieces for Decent: the signaling wire protocol, error types and
//! logging setup.
//!
//! Both the relay and the chat client depend on this crate so that the two
//! sides of the signaling channel can never disagree on the frame format.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with a specific default filter.
///
/// `RUST_LOG` takes precedence when set. Output goes to stderr so that
/// interactive front ends keep stdout to themselves.
pub fn init_tracing_with_default(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
