//! Authentication request and response bodies.

use serde::{Deserialize, Serialize};

/// `POST /auth/login` body.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    /// Account name.
    pub username: String,
    /// Plain password, sent over TLS only.
    pub password: String,
}

/// `POST /auth/register` body.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    /// Desired account name.
    pub username: String,
    /// Contact address used for invitations.
    pub email: String,
    /// Plain password.
    pub password: String,
}

/// `POST /auth/refresh-token` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Current refresh token.
    pub refresh_token: String,
}

/// Access/refresh pair returned by login and refresh.
///
/// Older servers answer login with a single `token` field; it is accepted
/// as the access token and the refresh token is then absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    /// Bearer token for API calls.
    #[serde(alias = "token")]
    pub access_token: String,
    /// Token exchanged for a new pair when the access token expires.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Account name, when the server echoes it.
    #[serde(default)]
    pub username: Option<String>,
}
