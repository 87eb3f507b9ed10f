//! Shared HTTP plumbing for model clients

use crate::infrastructure::model::types::ModelError;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Clone)]
pub struct HttpClientBase {
    pub id: String,
    pub endpoint: String,
    pub http: Client,
}

impl HttpClientBase {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            http: Client::new(),
        }
    }

    pub fn build_url(&self, path: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Post JSON to a local, unauthenticated service.
    ///
    /// Error statuses whose body still decodes as `Res` are returned as
    /// `Ok`, so the caller can read the service's own error field.
    pub async fn post_json<Req, Res>(&self, url: &str, body: &Req) -> Result<Res, ModelError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::network(&self.id, e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ModelError::network(&self.id, e));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ModelError::network(&self.id, e))?;
        serde_json::from_str(&text).map_err(|_| {
            ModelError::unavailable(
                &self.id,
                format!("HTTP {}: {}", status.as_u16(), text.trim()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_endpoint_and_path_with_one_slash() {
        let base = HttpClientBase::new("ollama", "http://127.0.0.1:11434/");
        assert_eq!(base.build_url("/api/chat"), "http://127.0.0.1:11434/api/chat");
        assert_eq!(base.build_url("api/tags"), "http://127.0.0.1:11434/api/tags");
    }
}
