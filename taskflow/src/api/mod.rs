//! Typed REST endpoints.
//!
//! [`Api`] is a thin facade over [`HttpClient`]: one method per endpoint,
//! typed request bodies in, typed models out. It holds no state of its own;
//! caching and invalidation live in [`crate::cache`] and [`crate::sync`].

mod activity;
mod auth;
mod groups;
mod tasks;

pub use tasks::PageRequest;

use crate::http::HttpClient;

/// REST endpoint wrappers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Api {
    http: HttpClient,
}

impl Api {
    /// Wrap a configured client.
    #[must_use]
    pub const fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Underlying client.
    #[must_use]
    pub const fn http(&self) -> &HttpClient {
        &self.http
    }
}
