//! Core domain types and logic.

pub mod market;
pub mod error;
pub mod fee_expr;
pub mod commission;
pub mod sizing;
pub mod config;
pub mod indicator;
pub mod ledger;
pub mod stats;
pub mod strategy;
pub mod coordinator;
