use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::credentials::CredentialFetcher;
use crate::error::CredentialError;
use crate::types::CredentialDocument;

/// Fetches credential documents from `GET {base_url}/{app_id}`.
pub struct HttpCredentialFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCredentialFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Per-request timeout. Defaults to 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url_for(&self, app_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), app_id)
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch_credentials(&self, app_id: &str) -> Result<CredentialDocument, CredentialError> {
        let url = self.url_for(app_id);
        debug!(url = %url, "Fetching credentials");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| CredentialError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CredentialError::Transient(format!("credential server returned {status}")));
        }
        if !status.is_success() {
            return Err(CredentialError::Rejected(format!("credential server returned {status}")));
        }

        response
            .json::<CredentialDocument>()
            .await
            .map_err(|err| CredentialError::Malformed(err.to_string()))
    }
}
