//! Ingestion pipeline for SRT session statistics.
//!
//! Live sessions supervise a receiver process and decode its CSV statistics
//! output; trace sessions reconcile records derived from a packet capture.
//! Both feed one append-only [`timeline::Timeline`] per session.

pub mod config;
pub mod decoder;
pub mod export;
pub mod reconcile;
pub mod sample;
pub mod session;
pub mod supervisor;
pub mod timeline;
