pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod observability;
pub mod state;
pub mod store;
