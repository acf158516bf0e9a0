//! labdesk - per-learner lab desktop orchestrator.
//!
//! Provisions one containerised remote desktop per LMS user, tracks live
//! sessions, and reclaims them after a fixed lifetime.

pub mod api;
pub mod audit;
pub mod auth;
pub mod container;
pub mod db;
pub mod desktop;
