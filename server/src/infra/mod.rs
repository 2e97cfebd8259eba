//! Infrastructure layer

pub mod connector;
pub mod docker;
pub mod event_bus;
pub mod event_repository;
pub mod infra_repository;
pub mod provisioner;
pub mod scm;
pub mod secret;
pub mod sqlite;
pub mod template;
