use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    login_id: &'a str,
    password: &'a str,
    device_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginResponse {
    data: Option<LoginData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LoginData {
    access_token: Option<String>,
    error_message: Option<String>,
}

/// Exchanges the configured credentials for a bearer token.
pub struct Authenticator {
    client: Client,
    login_url: String,
    username: String,
    password: String,
    device_id: String,
}

impl Authenticator {
    pub fn new(config: &FeedConfig) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(LOGIN_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            login_url: config.login_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            device_id: config.device_id.clone(),
        })
    }

    /// Log in and return the access token.
    pub async fn login(&self) -> FeedResult<String> {
        let resp = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest {
                login_id: &self.username,
                password: &self.password,
                device_id: &self.device_id,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Auth(format!("login failed: {status}")));
        }

        let body: LoginResponse = resp.json().await?;
        match body.data {
            Some(LoginData {
                access_token: Some(token),
                ..
            }) if !token.is_empty() => {
                info!(user = %self.username, "login succeeded");
                Ok(token)
            }
            Some(LoginData {
                error_message: Some(message),
                ..
            }) if !message.is_empty() => Err(FeedError::Auth(message)),
            _ => Err(FeedError::Auth(
                "token not found in login response".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::config::{DEFAULT_DEVICE_ID, HubSection, ServiceSection};

    fn config(login_url: String) -> FeedConfig {
        FeedConfig {
            login_url,
            signalr_url: "https://feed.example.com/marketHub".into(),
            username: "trader".into(),
            password: "secret".into(),
            device_id: DEFAULT_DEVICE_ID.into(),
            hub: HubSection::default(),
            service: ServiceSection::default(),
            subscriptions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn login_returns_access_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/login")
                .json_body(serde_json::json!({
                    "loginId": "trader",
                    "password": "secret",
                    "deviceId": DEFAULT_DEVICE_ID,
                }));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"data": {"accessToken": "tok-123"}}));
        });

        let auth = Authenticator::new(&config(server.url("/auth/login"))).unwrap();
        assert_eq!(auth.login().await.unwrap(), "tok-123");
        mock.assert();
    }

    #[tokio::test]
    async fn login_surfaces_error_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"data": {"errorMessage": "Invalid password"}}));
        });

        let auth = Authenticator::new(&config(server.url("/auth/login"))).unwrap();
        let err = auth.login().await.unwrap_err();
        assert!(matches!(err, FeedError::Auth(ref m) if m == "Invalid password"), "{err}");
    }

    #[tokio::test]
    async fn login_without_token_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"status": "ok"}));
        });

        let auth = Authenticator::new(&config(server.url("/auth/login"))).unwrap();
        let err = auth.login().await.unwrap_err();
        assert!(err.to_string().contains("token not found"), "{err}");
    }

    #[tokio::test]
    async fn login_http_failure_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(401);
        });

        let auth = Authenticator::new(&config(server.url("/auth/login"))).unwrap();
        let err = auth.login().await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }
}
