//! tuner-bridge library crate
//!
//! Impersonates an HDHomeRun network tuner towards Plex while sourcing the
//! actual video from IPTV upstreams. The binary in `main.rs` wires these
//! modules together; everything here is usable as a library for tests.

pub mod cache;
pub mod config;
pub mod database;
pub mod epg;
pub mod errors;
pub mod events;
pub mod models;
pub mod settings;
pub mod ssdp;
pub mod streaming;
pub mod utils;
pub mod web;
