//! netwatch-scan: LAN discovery and change detection.
//!
//! Sweeps an IPv4 range for live hosts, probes their ports, classifies
//! them, diffs each snapshot against the last one, and hands the changes
//! to the notification dispatcher.

pub mod classify;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod prober;
pub mod scheduler;
pub mod session;
pub mod vuln;
