//! signsync Sign — Adobe Sign REST client and directory → Sign user sync.
//!
//! This crate maps directory groups onto Sign groups, talks to the Sign
//! REST API with bounded concurrency and retries, and reconciles users
//! across one or more Sign orgs.

pub mod batch;
pub mod client;
pub mod connector;
pub mod groups;
pub mod mapping;
pub mod models;
pub mod policy;
pub mod retry;
pub mod sync;
pub mod transport;
