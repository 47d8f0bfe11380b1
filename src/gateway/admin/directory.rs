//! PostgREST-compatible privilege directory.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;
use url::Url;

use super::{PrivilegeDirectory, PrivilegeError};
use crate::APP_USER_AGENT;

pub struct HttpPrivilegeDirectory {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl std::fmt::Debug for HttpPrivilegeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPrivilegeDirectory")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpPrivilegeDirectory {
    /// Per-call time limits are applied by the resolver, not the client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &Url, api_key: SecretString) -> reqwest::Result<Self> {
        let client = Client::builder().user_agent(APP_USER_AGENT).build()?;
        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Call `rpc/{function}` as the user when a token is available, otherwise
    /// with the API key alone.
    async fn call(
        &self,
        function: &str,
        user_id: &str,
        access_token: Option<&SecretString>,
    ) -> Result<bool, PrivilegeError> {
        let bearer = access_token.unwrap_or(&self.api_key);
        let response = self
            .client
            .post(format!("{}/rpc/{function}", self.base_url))
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
            .json(&json!({ "user_id": user_id }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PrivilegeError::Timeout
                } else {
                    PrivilegeError::Unavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(PrivilegeError::Rejected {
                status: status.as_u16(),
                message: body["message"]
                    .as_str()
                    .or_else(|| body["hint"].as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| PrivilegeError::InvalidResponse(err.to_string()))?;
        body.as_bool()
            .ok_or_else(|| PrivilegeError::InvalidResponse(format!("{function} did not return a boolean")))
    }
}

#[async_trait]
impl PrivilegeDirectory for HttpPrivilegeDirectory {
    #[instrument(skip(self, access_token))]
    async fn is_admin(
        &self,
        user_id: &str,
        access_token: Option<&SecretString>,
    ) -> Result<bool, PrivilegeError> {
        self.call("is_admin", user_id, access_token).await
    }

    #[instrument(skip(self, access_token))]
    async fn is_master_admin(
        &self,
        user_id: &str,
        access_token: Option<&SecretString>,
    ) -> Result<bool, PrivilegeError> {
        self.call("is_master_admin", user_id, access_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    #[tokio::test]
    async fn rpc_returns_boolean() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/is_admin"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer user-token"))
            .and(body_json(json!({"user_id": "u1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/is_master_admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(false)))
            .mount(&server)
            .await;

        let directory =
            HttpPrivilegeDirectory::new(&Url::parse(&server.uri())?, SecretString::from("service-key"))?;
        let token = SecretString::from("user-token");
        assert!(directory.is_admin("u1", Some(&token)).await?);
        assert!(!directory.is_master_admin("u1", Some(&token)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_jwt_is_auth_error() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/is_admin"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"code": "PGRST301", "message": "JWT expired"})),
            )
            .mount(&server)
            .await;

        let directory =
            HttpPrivilegeDirectory::new(&Url::parse(&server.uri())?, SecretString::from("key"))?;
        let err = directory
            .is_admin("u1", None)
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(err.is_auth_error());
        Ok(())
    }

    #[tokio::test]
    async fn non_boolean_body_is_invalid() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/is_admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_admin": true})))
            .mount(&server)
            .await;

        let directory =
            HttpPrivilegeDirectory::new(&Url::parse(&server.uri())?, SecretString::from("key"))?;
        assert!(matches!(
            directory.is_admin("u1", None).await,
            Err(PrivilegeError::InvalidResponse(_))
        ));
        Ok(())
    }
}
