//! Gatekeeper - Request Admission Control
//!
//! This crate implements the admission-control core of an API gateway: for
//! each inbound request it decides ALLOW or BLOCK from deny-list membership
//! and per-dimension fixed-window rate quotas. State lives behind a
//! pluggable key-value/counter backend (in-process or Redis), and the
//! decision path is fail-open: the admission layer never takes the
//! protected service down because its own dependency is slow or unhealthy.

pub mod admission;
pub mod blacklist;
pub mod ratelimit;
pub mod storage;
pub mod config;
pub mod error;
