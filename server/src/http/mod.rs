//! HTTP fan-in endpoints.

pub mod broadcast;
