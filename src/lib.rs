//! TRIANGULUM: triangular arbitrage engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod clock;
pub mod config;
pub mod types;
pub mod exchange;
pub mod strategy;
pub mod engine;
pub mod storage;
pub mod service;
pub mod dashboard;
