//! Shared types and collaborator interfaces for the build solver.
//!
//! Every crate in the workspace talks to the others through the traits
//! defined here: workers resolve operations, frontends turn requests into
//! results, exporters consume results, and cache exporters/importers move
//! cache provenance in and out of the solver.

pub mod cache;
pub mod context;
pub mod definition;
pub mod digest;
pub mod errors;
pub mod exporter;
pub mod frontend;
pub mod platform;
pub mod progress;
pub mod result;
pub mod worker;

pub use cache::*;
pub use context::*;
pub use definition::*;
pub use digest::*;
pub use errors::*;
pub use exporter::*;
pub use frontend::*;
pub use platform::*;
pub use progress::*;
pub use result::*;
pub use worker::*;
