//! Dependency-ordered pipeline execution for the sites lakehouse.
//!
//! Nodes are registered once, frozen into a validated [`Graph`], and run by
//! [`PipelineRunner`] against a [`strata_store::MaterializationStore`].

pub mod capabilities;
pub mod columnar;
pub mod config;
pub mod errors;
pub mod events;
pub mod export;
pub mod graph;
pub mod runner;
pub mod runtime;
pub mod sink;
pub mod sites;
pub mod staging;
pub mod table;
pub mod tool;

pub use capabilities::*;
pub use columnar::*;
pub use config::*;
pub use errors::*;
pub use events::*;
pub use export::*;
pub use graph::*;
pub use runner::*;
pub use runtime::*;
pub use sink::*;
pub use sites::*;
pub use staging::*;
pub use table::*;
pub use tool::*;
