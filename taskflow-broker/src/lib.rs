//! `taskflow` development broker.
//!
//! A small STOMP 1.2 broker over WebSocket: clients connect, subscribe to
//! destinations, and receive every frame published to them. Used to run the
//! client against a local stack and as the in-process broker in tests.
//! Delivery is best-effort and at-most-once; nothing is persisted.

pub mod broker;
pub mod config;
