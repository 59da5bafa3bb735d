//! Command implementations.
//!
//! Each subcommand that talks to a port is implemented in its own module.

pub(crate) mod monitor;
pub(crate) mod send;
