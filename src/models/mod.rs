//! Core data models for the sheets verification service.
//!
//! These types cross every boundary of the service: they are persisted to
//! disk and SQLite as JSON and returned verbatim by the HTTP handlers, so
//! they all derive `serde` with the wire names the web frontend expects.

pub mod credential;
pub mod drive_file;
pub mod job;
