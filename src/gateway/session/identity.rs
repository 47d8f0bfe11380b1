//! GoTrue-compatible identity provider over HTTP.

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};
use url::Url;

use super::{IdentityProvider, ProviderError, Session, SessionCredentials};
use crate::{gateway::clock::Clock, APP_USER_AGENT};

pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpIdentityProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: &Url,
        api_key: SecretString,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            api_key,
            clock,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn session_from_token_response(&self, body: &Value) -> Result<Session, ProviderError> {
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidResponse("no access_token found".to_string()))?;
        let claims = decode_claims(access_token);
        let user_id = body["user"]["id"]
            .as_str()
            .or_else(|| claims.as_ref().and_then(|c| c["sub"].as_str()))
            .ok_or_else(|| ProviderError::InvalidResponse("no user id found".to_string()))?;

        let now = self.clock.now_ms();
        let expires_at_ms = body["expires_at"]
            .as_i64()
            .map(|secs| secs * 1000)
            .or_else(|| body["expires_in"].as_i64().map(|secs| now + secs * 1000))
            .or_else(|| claims.as_ref().and_then(|c| c["exp"].as_i64()).map(|secs| secs * 1000))
            .ok_or_else(|| ProviderError::InvalidResponse("no expiry found".to_string()))?;
        let issued_at_ms = claims
            .as_ref()
            .and_then(|c| c["iat"].as_i64())
            .map_or(now, |secs| secs * 1000);

        Ok(Session {
            user_id: user_id.to_string(),
            email: body["user"]["email"].as_str().map(ToString::to_string),
            issued_at_ms,
            expires_at_ms,
            access_token: SecretString::from(access_token.to_string()),
            refresh_token: body["refresh_token"]
                .as_str()
                .map(|token| SecretString::from(token.to_string())),
        })
    }
}

/// Read the claims of a JWT without checking the signature. The provider's
/// `/user` endpoint is what vouches for the token.
fn decode_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = Base64UrlUnpadded::decode_vec(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// `sub` claim of an access token. Unverified, so only fit for dropping state
/// keyed by the user.
pub(super) fn token_subject(token: &str) -> Option<String> {
    decode_claims(token)?["sub"].as_str().map(ToString::to_string)
}

/// Best-effort error text from a GoTrue error body.
fn error_message(body: &Value) -> String {
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| body[*key].as_str())
        .unwrap_or_default()
        .to_string()
}

async fn rejected(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    ProviderError::Rejected {
        status,
        message: error_message(&body),
    }
}

fn unavailable(err: &reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(err.to_string())
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip_all)]
    async fn get_session(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Option<Session>, ProviderError> {
        let Some(access_token) = &credentials.access_token else {
            return Ok(None);
        };
        let Some(claims) = decode_claims(access_token.expose_secret()) else {
            debug!("access token is not a JWT");
            return Ok(None);
        };
        let (Some(sub), Some(exp)) = (claims["sub"].as_str(), claims["exp"].as_i64()) else {
            return Ok(None);
        };
        let session = Session {
            user_id: sub.to_string(),
            email: claims["email"].as_str().map(ToString::to_string),
            issued_at_ms: claims["iat"]
                .as_i64()
                .map_or_else(|| self.clock.now_ms(), |secs| secs * 1000),
            expires_at_ms: exp * 1000,
            access_token: access_token.clone(),
            refresh_token: credentials.refresh_token.clone(),
        };

        // The provider rejects expired tokens; report them as expired instead.
        if session.expires_at_ms < self.clock.now_ms() {
            return Ok(Some(session));
        }

        let response = self
            .client
            .get(self.endpoint("/user"))
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(|err| unavailable(&err))?;

        match response.status() {
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
                if body["id"].as_str() != Some(session.user_id.as_str()) {
                    debug!("token subject does not match provider user");
                    return Ok(None);
                }
                Ok(Some(Session {
                    email: body["email"]
                        .as_str()
                        .map(ToString::to_string)
                        .or(session.email.clone()),
                    ..session
                }))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            _ => Err(rejected(response).await),
        }
    }

    #[instrument(skip_all)]
    async fn refresh_session(&self, refresh_token: &SecretString) -> Result<Session, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/token?grant_type=refresh_token"))
            .header("apikey", self.api_key.expose_secret())
            .json(&json!({ "refresh_token": refresh_token.expose_secret() }))
            .send()
            .await
            .map_err(|err| unavailable(&err))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        self.session_from_token_response(&body)
    }

    #[instrument(skip_all)]
    async fn sign_out(&self, access_token: &SecretString) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/logout"))
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(|err| unavailable(&err))?;

        match response.status() {
            // Already signed out or unknown token: nothing left to clear.
            status
                if status.is_success()
                    || status == StatusCode::UNAUTHORIZED
                    || status == StatusCode::NOT_FOUND =>
            {
                Ok(())
            }
            _ => Err(rejected(response).await),
        }
    }
}
