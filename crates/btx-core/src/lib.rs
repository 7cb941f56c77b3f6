//! Core domain + application logic for the BETRIX bot gateway.
//!
//! This crate is intentionally framework-agnostic. Telegram / OpenAI / the admin
//! HTTP surface live behind ports (traits) implemented in adapter crates.

pub mod activation;
pub mod activity;
pub mod admin_client;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod ops;
pub mod ports;
pub mod rollout;
pub mod security;
pub mod utils;

pub use errors::{Error, Result};
