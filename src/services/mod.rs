//! Business logic services
//!
//! This module contains business logic separated from HTTP concerns.

pub mod credentials;
pub mod network;
