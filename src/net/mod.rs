//! Networking modules for the backend REST API.
//!
//! SYSTEM CONTEXT
//! ==============
//! `api` performs HTTP calls and classifies failures; `types` defines the
//! JSON shapes exchanged with the backend.

pub mod api;
pub mod types;
