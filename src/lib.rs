// Broker Token Keeper - Library root

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod secrets;
