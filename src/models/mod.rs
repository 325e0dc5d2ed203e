//! Core data models for the converter.
//!
//! `object` describes what the remote listing yields; `conversion` maps the
//! ledger table via `sqlx::FromRow`.

pub mod conversion;
pub mod object;
