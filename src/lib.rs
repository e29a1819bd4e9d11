//! Disease-name extraction service
//!
//! Streams LLM-based disease extraction over spreadsheet rows as a
//! resumable, checkpointed batch job, served over HTTP with axum.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
