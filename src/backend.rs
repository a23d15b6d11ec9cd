//! Client of the demo backend's flag-gated endpoints.

use reqwest::Url;
use serde_json::{Map, Value};

use crate::{document::directory_url, Error, Result};

const FLAGS_ENDPOINT: &str = "api/flags";
const HELLO_ENDPOINT: &str = "api/hello";
const SECRET_ENDPOINT: &str = "api/secret";

/// Calls the backend with a `userId` query parameter and returns the JSON bodies untouched.
#[derive(Debug, Clone)]
pub struct BackendClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base: Url,
}

impl BackendClient {
    /// Create a client for the backend at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(BackendClient {
            client: reqwest::Client::new(),
            base: directory_url(base_url)?,
        })
    }

    /// `GET /api/flags`: the flags the backend evaluates for `user_id`.
    pub async fn flags(&self, user_id: &str) -> Result<Value> {
        let response = self.get(FLAGS_ENDPOINT, user_id).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                service: "backend",
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// `GET /api/hello`. The body is returned whatever the status.
    pub async fn hello(&self, user_id: &str) -> Result<Value> {
        let response = self.get(HELLO_ENDPOINT, user_id).await?;
        Ok(response.json().await?)
    }

    /// `GET /api/secret`, which the backend gates behind a flag.
    ///
    /// A non-success status is not an error: the result is `{"error": "HTTP <status>"}` merged
    /// with whatever JSON object the backend sent.
    pub async fn secret(&self, user_id: &str) -> Result<Value> {
        let response = self.get(SECRET_ENDPOINT, user_id).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        log::debug!(target: "flagswitch", status = status.as_u16(); "secret endpoint refused access");
        let mut body = Map::new();
        body.insert(
            "error".to_owned(),
            Value::String(format!("HTTP {}", status.as_u16())),
        );
        if let Ok(Value::Object(details)) = response.json::<Value>().await {
            body.extend(details);
        }
        Ok(Value::Object(body))
    }

    async fn get(&self, endpoint: &str, user_id: &str) -> Result<reqwest::Response> {
        let mut url = self.base.join(endpoint).map_err(Error::InvalidBaseUrl)?;
        url.query_pairs_mut().append_pair("userId", user_id);

        log::debug!(target: "flagswitch", endpoint, user_id; "calling backend");
        Ok(self.client.get(url).send().await?)
    }
}
