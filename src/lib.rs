//! Portcullis - identity and access proxy
//!
//! Sits in front of a backend, matches every request against a refreshed rule
//! set, asks the policy service where rules demand it, and forwards allowed
//! requests with freshly signed credentials.
//! It exposes all modules for testing purposes.

pub mod access;
pub mod errors;
pub mod health;
pub mod keys;
pub mod refresh;
pub mod settings;
pub mod web;
