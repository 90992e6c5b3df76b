//! Billing Validation Pipeline
//!
//! This library provides the core functionality for the billing-validate
//! system: an asynchronous pipeline that turns uploaded healthcare billing
//! CSV files into durable background validation jobs, evaluates them against
//! a pluggable rule set, and streams status back to clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
