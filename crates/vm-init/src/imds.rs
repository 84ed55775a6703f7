//! Instance metadata service (IMDSv2) client.
//!
//! Every request carries a session token obtained once with a `PUT`.
//! There are no request timeouts: the VM cannot do anything useful before
//! the metadata service answers.

use reqwest::StatusCode;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config;

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";

const USER_DATA_PATH: &str = "/latest/user-data";
const PUBLIC_KEY_PATH: &str = "/latest/meta-data/public-keys/0/openssh-key";
const REGION_PATH: &str = "/latest/meta-data/placement/region";

#[derive(Debug, thiserror::Error)]
pub enum ImdsError {
    #[error("imds {path}: {source}")]
    Request {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("imds {path}: HTTP {status}")]
    Status { path: &'static str, status: u16 },
}

#[derive(Debug)]
pub struct Imds {
    client: reqwest::Client,
    endpoint: String,
    token: OnceCell<String>,
}

impl Imds {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: OnceCell::new(),
        }
    }

    /// Client for the endpoint configured via `VMINIT_IMDS_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::new(config::imds_endpoint())
    }

    async fn token(&self) -> Result<&str, ImdsError> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .put(format!("{}{TOKEN_PATH}", self.endpoint))
                    .header(TOKEN_TTL_HEADER, config::IMDS_TOKEN_TTL_SECS.to_string())
                    .send()
                    .await
                    .map_err(|source| ImdsError::Request {
                        path: TOKEN_PATH,
                        source,
                    })?;
                read_body(TOKEN_PATH, response).await
            })
            .await?;
        Ok(token.as_str())
    }

    /// `GET` a metadata path. `None` when the service answers 404.
    async fn get(&self, path: &'static str) -> Result<Option<String>, ImdsError> {
        let token = self.token().await?;
        let response = self
            .client
            .get(format!("{}{path}", self.endpoint))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|source| ImdsError::Request { path, source })?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "not present in instance metadata");
            return Ok(None);
        }
        read_body(path, response).await.map(Some)
    }

    /// Launch-time user data, `None` when the instance was started without any.
    pub async fn user_data(&self) -> Result<Option<String>, ImdsError> {
        self.get(USER_DATA_PATH).await
    }

    /// The first SSH public key attached at launch.
    pub async fn public_key(&self) -> Result<Option<String>, ImdsError> {
        self.get(PUBLIC_KEY_PATH).await
    }

    pub async fn region(&self) -> Result<String, ImdsError> {
        self.get(REGION_PATH)
            .await?
            .map(|r| r.trim().to_string())
            .ok_or(ImdsError::Status {
                path: REGION_PATH,
                status: StatusCode::NOT_FOUND.as_u16(),
            })
    }
}

async fn read_body(path: &'static str, response: reqwest::Response) -> Result<String, ImdsError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ImdsError::Status {
            path,
            status: status.as_u16(),
        });
    }
    response
        .text()
        .await
        .map_err(|source| ImdsError::Request { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    async fn with_token(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path(TOKEN_PATH)
                    .header(TOKEN_TTL_HEADER, "21600");
                then.status(200).body("tok");
            })
            .await
    }

    #[tokio::test]
    async fn user_data_uses_session_token() {
        let server = MockServer::start_async().await;
        let token = with_token(&server).await;
        let user_data = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(USER_DATA_PATH)
                    .header(TOKEN_HEADER, "tok");
                then.status(200).body("command: [\"/app\"]\n");
            })
            .await;

        let imds = Imds::new(server.base_url());
        assert_eq!(
            imds.user_data().await.unwrap().as_deref(),
            Some("command: [\"/app\"]\n")
        );
        // The token is fetched once per client.
        imds.user_data().await.unwrap();
        token.assert_calls_async(1).await;
        user_data.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn missing_user_data_is_none() {
        let server = MockServer::start_async().await;
        with_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(USER_DATA_PATH);
                then.status(404);
            })
            .await;

        let imds = Imds::new(server.base_url());
        assert_eq!(imds.user_data().await.unwrap(), None);
    }

    #[tokio::test]
    async fn region_and_public_key() {
        let server = MockServer::start_async().await;
        with_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(REGION_PATH);
                then.status(200).body("eu-west-1\n");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(PUBLIC_KEY_PATH);
                then.status(200).body("ssh-ed25519 AAAA user@host");
            })
            .await;

        let imds = Imds::new(format!("{}/", server.base_url()));
        assert_eq!(imds.region().await.unwrap(), "eu-west-1");
        assert_eq!(
            imds.public_key().await.unwrap().as_deref(),
            Some("ssh-ed25519 AAAA user@host")
        );
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start_async().await;
        with_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(REGION_PATH);
                then.status(500);
            })
            .await;

        let imds = Imds::new(server.base_url());
        let err = imds.region().await.unwrap_err();
        assert!(matches!(err, ImdsError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn token_failure_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path(TOKEN_PATH);
                then.status(403);
            })
            .await;

        let imds = Imds::new(server.base_url());
        let err = imds.user_data().await.unwrap_err();
        assert!(matches!(
            err,
            ImdsError::Status {
                path: TOKEN_PATH,
                status: 403
            }
        ));
    }
}
