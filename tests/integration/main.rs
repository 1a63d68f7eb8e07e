//! Integration tests for the arbitrage engine.

mod mock_connector;
mod scenarios;
