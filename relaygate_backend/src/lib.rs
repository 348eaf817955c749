pub mod admin;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod health;
pub mod node;
pub mod notices;
pub mod queue;
pub mod relay;
pub mod settings;
pub mod spam;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod utils;
pub mod verification;
