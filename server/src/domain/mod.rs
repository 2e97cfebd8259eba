//! Domain models

pub mod container;
pub mod devcontainer;
pub mod event;
pub mod feature;
pub mod gitspace;
pub mod ide;
pub mod infra;
pub mod run_arg;

pub use container::*;
pub use devcontainer::*;
pub use event::*;
pub use feature::*;
pub use gitspace::*;
pub use ide::*;
pub use infra::*;
pub use run_arg::*;
