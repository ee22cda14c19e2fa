#![warn(missing_docs)]

//! Keel controller catalogue.
//!
//! Projection controllers turn the machine configuration into spec
//! resources; reconcilers apply those specs to the host (kernel parameters
//! and modules, seccomp profiles, extension configs, watchdog, scrubs, OOM
//! handling) and publish what they observe. [`Catalogue`] wires the whole set
//! into a [`keel_runtime::Runtime`].

pub mod catalogue;
pub mod config;
pub mod cri;
pub mod kernel;
pub mod logging;
pub mod paths;
pub mod runtime;
pub mod sys;

#[cfg(test)]
mod testutil;

pub use catalogue::{Catalogue, CatalogueError};
pub use paths::SystemPaths;
