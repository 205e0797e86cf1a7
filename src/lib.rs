//! Single-shot container image builder. Clones a source repository,
//! builds and tests the image on a disposable engine host, pushes the
//! tags and cleans up after itself, reporting through separated public
//! and private logs.

pub mod build;
pub mod cleanup;
pub mod config;
pub mod docker;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod hooks;
pub mod logs;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod startup;
pub mod sut;
pub mod upload;
pub mod vcs;
