//! Integrations with external analysis services

pub mod adapter;
pub mod commands;
pub mod hub;

pub use adapter::{IntegrationAdapter, IntegrationError};
pub use commands::{descriptors_for, IntegrationCommand};
pub use hub::IntegrationHub;
