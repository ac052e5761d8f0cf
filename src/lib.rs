pub mod admin;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod interfaces;
pub mod lorawan;
pub mod models;
pub mod store;
