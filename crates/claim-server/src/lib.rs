//! Claim Server - email-verified ERC-20 allocation claims
//!
//! This crate provides an HTTP server that lets the holder of an email-keyed token allocation
//! claim it to a wallet they control:
//! 1. An administrator uploads allocations as CSV; repeated uploads accumulate into the
//!    unclaimed allocation for each email
//! 2. The claimant proves possession of the email with a one-time code and receives a session
//! 3. Optionally, the claimant proves wallet ownership by signing a SIWE challenge
//! 4. The server transfers the allocation from the distributor wallet, bounded by token and gas
//!    balances and a gas cost cap, and records the transaction hash exactly once

pub mod admin;
pub mod config;
pub mod distribution;
pub mod email;
pub mod error;
pub mod eth;
pub mod gas;
pub mod http;
pub mod ingest;
pub mod model;
pub mod otp;
pub mod rate_limit;
pub mod secrets;
pub mod session;
pub mod siwe;
pub mod state;
pub mod store;
pub mod units;
pub mod wallet;

pub use config::ClaimConfig;
pub use error::{ClaimError, ClaimResult};
