//! Subcommands of the `andy-broker` binary.

pub(crate) mod list;
pub(crate) mod serve;
