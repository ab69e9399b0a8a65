//! Shared wire definitions for `taskflow`: REST payloads, the domain
//! projection the client caches, and the STOMP framing used on the
//! real-time channel.

pub mod auth;
pub mod model;
pub mod payload;
pub mod stomp;
pub mod topic;
