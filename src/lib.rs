pub mod broker;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod validator;
