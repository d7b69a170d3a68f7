pub mod config;
pub mod error;
pub mod months;
pub mod server;
pub mod service;
pub mod store;
