//! Ratewindow - Distributed Fixed-Window Rate Limit Counters
//!
//! This crate keeps fixed-window rate limit counters in a shared key-value
//! store. Any number of processes can record events against the same
//! identifiers: counters are created, incremented and given an expiry under
//! optimistic transactions, so racing callers never lose an update or leave
//! a counter that never expires.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
