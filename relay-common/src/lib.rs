pub mod config_source;
pub mod health;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod webhook;
