pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod services;
