//! Filesystem-level control group primitives: controller discovery, path
//! resolution with anti-escape guarantees, discretionary access checks with a
//! client's credentials rather than our own, and the directory operations the
//! broker performs on behalf of its clients.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod access;
pub mod common;
pub mod mount;
pub mod ns;
pub mod ops;
pub mod paths;
