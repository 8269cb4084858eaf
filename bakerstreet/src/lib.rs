//! Shared plumbing for the hudson, watson and sherlock binaries

pub mod identity;
pub mod shutdown;
