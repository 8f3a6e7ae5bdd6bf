//! Shared wire types for the `sdpctl` workspace.
//!
//! The CLI and the fake collective used in integration tests both speak these types.

#![warn(missing_docs)]

/// Admin API DTOs.
pub mod api;
