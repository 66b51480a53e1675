//! Core data models for the config object store.
//!
//! Accounts describe where objects live, object types describe how they are
//! laid out, and canary-config models describe what the summary index holds.

pub mod account;
pub mod canary_config;
pub mod object_type;
