#![allow(dead_code)]

pub mod builders;
pub mod servers;

pub use builders::RuleBuilder;
pub use servers::{mock_backend, mock_policy, spawn, TestGate};
