//! Cairn server library - HTTP surface for the checkpoint engine.
//!
//! Routes, configuration, logging and application state live here so the
//! router can be driven directly from integration tests.

pub mod config;
pub mod logging;
pub mod routes;
pub mod state;
