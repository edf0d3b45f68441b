//! Redoubt provisioning server
//!
//! Machines describe themselves in a harvest request; configured policies
//! decide which products they receive. Products that need private material
//! are negotiated over several rounds so that keys are generated on the
//! machine and never leave it.

pub mod backend;
pub mod config;
pub mod error;
pub mod expr;
pub mod harvest;
pub mod http;
pub mod probe;
pub mod producer;
pub mod registry;

pub use config::Config;
pub use harvest::Harvester;
pub use registry::Registry;
