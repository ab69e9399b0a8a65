//! `taskflow`: live-synchronized client core for a team task manager.

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod http;
pub mod realtime;
pub mod session;
pub mod sync;
