//! Girder Core
//!
//! Domain types, rule syntax, the definition registry and the port traits
//! shared by the scheduler, the artifact stores and the CLI.

pub mod agent;
pub mod artifact;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod filters;
pub mod ids;
pub mod params;
pub mod ports;
pub mod registry;
pub mod requirement;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
