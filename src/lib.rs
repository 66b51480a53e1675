//! Versioned configuration objects (canary configs, result archives, metric
//! sets) kept in an object store, with a summary index of canary configs kept
//! in step with every write and delete.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
