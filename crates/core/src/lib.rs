//! signsync core — configuration, error types and directory connectors.

pub mod config;
pub mod connectors;
pub mod error;
pub mod models;
