pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod input;
pub mod pipeline;
pub mod queue;
pub mod resolver;
pub mod worker;
