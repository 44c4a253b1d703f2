pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gateways;
pub mod routes;
pub mod validation;
pub mod webhooks;
