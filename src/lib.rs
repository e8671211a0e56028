//! Client-side session core for the CRM console.
//!
//! SYSTEM CONTEXT
//! ==============
//! `state` holds the session and persists it, `guard` gates protected views
//! on that session, `net` talks to the backend, and `console` wires one of
//! each together for the `crm-console` binary.

pub mod config;
pub mod console;
pub mod guard;
pub mod net;
pub mod state;
