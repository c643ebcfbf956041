//! fctoken library
//!
//! Parsing, caching and refresh scheduling for time-windowed activation
//! codes. The binary in `main.rs` is a thin command-line layer over
//! [`app::App`].

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod policy;
pub mod refresh;
