pub mod body;
pub mod buffer;
pub mod config;
pub mod error;
pub mod health;
pub mod helpers;
pub mod loadbalance;
pub mod metrics;
pub mod pause;
pub mod router;
pub mod server;
pub mod service;
pub mod servicemap;
pub mod state_store;
pub mod target;
