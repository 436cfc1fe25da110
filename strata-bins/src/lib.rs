//! Shared code for the strata binaries

pub mod common;
