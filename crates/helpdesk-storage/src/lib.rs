//! Helpdesk Storage - Relational and object storage
//!
//! This crate holds the PostgreSQL-backed repositories for channels,
//! tickets, conversations, messages, attachments and spam audit logs,
//! plus the object storage used for attachment bytes.

pub mod db;
pub mod file;
pub mod models;
pub mod repository;

pub use db::{Database, DatabasePool};
pub use file::{create_storage, FileStorage, LocalStorage};
pub use models::*;
pub use repository::*;
