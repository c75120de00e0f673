//! Helpdesk Common - Shared types and utilities
//!
//! This crate provides the configuration model, error taxonomy and
//! channel-agnostic domain types shared by every helpdesk component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
