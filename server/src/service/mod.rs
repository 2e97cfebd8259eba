//! Service layer

pub mod container;
pub mod events;
pub mod feature;
pub mod gitspace;
pub mod ide;
pub mod logger;
pub mod orchestrator;
