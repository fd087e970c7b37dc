//! # Cgtether
//! Runs a command inside one or more Linux cgroup (v1) controller
//! directories and couples its lifetime to the process that launched it.
//! When the host closes the helper's stdin or stdout, signals it, or the
//! child exits, everything left in the cgroups is killed and the
//! directories the helper created are removed.

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod cgroups;
pub mod cleanup;
pub mod logger;
pub mod opts;
pub mod process;
pub mod signal;
pub mod supervisor;
mod test_util;
