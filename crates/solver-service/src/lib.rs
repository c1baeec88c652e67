//! Command-line service for the build solver.
//!
//! # Components
//!
//! - `cli`: command-line arguments
//! - `service`: builds a solver from configuration and runs solves

pub mod cli;
pub mod service;
