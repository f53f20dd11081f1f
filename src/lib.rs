//! Live TCP connection monitor.
//!
//! Reads the OS connection table for IPv4 and IPv6, attaches the owning
//! process to every row and republishes the whole list on a fixed interval.

pub mod backends;
pub mod config;
pub mod connection;
pub mod monitor;
pub mod projection;
pub mod snapshot;
