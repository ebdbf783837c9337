use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;

use super::{SettingsAuthority, TokenSource};
use crate::error::RemoteError;
use crate::settings::{SettingsPatch, SettingsUpdate};

/// REST settings authority.
///
/// `GET endpoint` returns the record, `POST endpoint` stores one and echoes
/// the normalized result.
pub struct HttpAuthority {
    endpoint: String,
    client: Client,
    token: Option<Arc<dyn TokenSource>>,
}

impl HttpAuthority {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
            token: None,
        })
    }

    pub fn with_token(mut self, token: Arc<dyn TokenSource>) -> Self {
        self.token = Some(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_ref().and_then(|t| t.token()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn decode(response: Response) -> Result<SettingsPatch, RemoteError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SettingsAuthority for HttpAuthority {
    async fn fetch(&self) -> Result<SettingsPatch, RemoteError> {
        let request = self
            .client
            .get(&self.endpoint)
            .header(header::ACCEPT, "application/json");

        let response = self.authorize(request).send().await?;
        Self::decode(response).await
    }

    async fn push(&self, update: &SettingsUpdate) -> Result<SettingsPatch, RemoteError> {
        let request = self
            .client
            .post(&self.endpoint)
            .header(header::ACCEPT, "application/json")
            .json(update);

        let response = self.authorize(request).send().await?;
        Self::decode(response).await
    }
}
