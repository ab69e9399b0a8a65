use taskflow_proto::auth::{LoginRequest, RefreshRequest, RegisterRequest, TokenResponse};

use super::Api;
use crate::http::{ApiError, ApiRequest};

impl Api {
    /// Exchange a username and password for a session, storing it in the
    /// client's [`TokenStore`](crate::session::TokenStore).
    ///
    /// Returns the username the session belongs to.
    ///
    /// # Errors
    ///
    /// [`ApiError::Unauthorized`] on bad credentials, [`ApiError::Decode`]
    /// if the response lacks a refresh token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let req = ApiRequest::post("/auth/login")
            .anonymous()
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })?;
        let pair: TokenResponse = self.http.send_json(&req).await?;
        self.store_session(pair, username)
    }

    /// Create an account. The server does not log the new user in.
    ///
    /// # Errors
    ///
    /// [`ApiError::Validation`] if the username or email is taken.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<(), ApiError> {
        let req = ApiRequest::post("/auth/register")
            .anonymous()
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })?;
        self.http.send_empty(&req).await?;
        tracing::info!(username, "account registered");
        Ok(())
    }

    /// End the session. The server is told on a best-effort basis; the local
    /// session is cleared either way.
    pub async fn logout(&self) {
        let tokens = self.http.tokens();
        if let Some(refresh_token) = tokens.refresh_token() {
            let notify = ApiRequest::post("/auth/logout").json(&RefreshRequest { refresh_token });
            match notify {
                Ok(req) => {
                    if let Err(e) = self.http.send_empty(&req).await {
                        tracing::debug!(error = %e, "server logout failed, clearing locally");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "could not build logout request"),
            }
        }
        tokens.clear();
    }

    fn store_session(&self, pair: TokenResponse, username: &str) -> Result<String, ApiError> {
        let Some(refresh_token) = pair.refresh_token else {
            return Err(ApiError::Decode(
                "login response carried no refresh token".to_string(),
            ));
        };
        let username = pair.username.unwrap_or_else(|| username.to_string());
        self.http
            .tokens()
            .set_credentials(pair.access_token, refresh_token, username.clone());
        tracing::info!(%username, "logged in");
        Ok(username)
    }
}
