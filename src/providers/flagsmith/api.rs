use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    document::directory_url,
    flag_store::FlagSnapshot,
    Error, Reason, Result,
};

use super::engine::{raw_flag, FeatureState};

const ENVIRONMENT_KEY_HEADER: &str = "X-Environment-Key";
const IDENTITIES_ENDPOINT: &str = "identities/";

/// A client of the Flagsmith REST API, authenticated with a client-side environment key.
pub(crate) struct FlagsmithApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base: Url,
    environment_key: String,
}

#[derive(Debug, Serialize)]
struct IdentifyRequest<'a> {
    identifier: &'a str,
    traits: Vec<TraitPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct TraitPayload<'a> {
    trait_key: &'a str,
    trait_value: &'a Value,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    #[serde(default)]
    flags: Vec<FeatureState>,
}

impl FlagsmithApi {
    pub fn new(api_url: &str, environment_key: impl Into<String>) -> Result<Self> {
        Ok(FlagsmithApi {
            client: reqwest::Client::new(),
            base: directory_url(api_url)?,
            environment_key: environment_key.into(),
        })
    }

    pub fn environment_key(&self) -> &str {
        &self.environment_key
    }

    /// Identify `identifier` with `traits` and return its flags.
    pub async fn identify(
        &self,
        identifier: &str,
        traits: &Map<String, Value>,
    ) -> Result<FlagSnapshot> {
        let url = self
            .base
            .join(IDENTITIES_ENDPOINT)
            .map_err(Error::InvalidBaseUrl)?;
        let request = IdentifyRequest {
            identifier,
            traits: traits
                .iter()
                .map(|(trait_key, trait_value)| TraitPayload {
                    trait_key,
                    trait_value,
                })
                .collect(),
        };

        log::debug!(target: "flagswitch", identifier; "identifying with Flagsmith");
        let response = self
            .client
            .post(url)
            .header(ENVIRONMENT_KEY_HEADER, &self.environment_key)
            .json(&request)
            .send()
            .await?;
        let body: IdentifyResponse = check_status(response)?.json().await?;
        Ok(to_snapshot(&body.flags))
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            log::warn!(target: "flagswitch", "Flagsmith rejected the environment key. Check FLAGSMITH_ENVIRONMENT_ID");
            Err(Error::UnexpectedStatus {
                service: "flagsmith",
                status: response.status().as_u16(),
            })
        }
        status => {
            log::warn!(target: "flagswitch", "received non-200 response from Flagsmith: {}", status);
            Err(Error::UnexpectedStatus {
                service: "flagsmith",
                status: status.as_u16(),
            })
        }
    }
}

fn to_snapshot(flags: &[FeatureState]) -> FlagSnapshot {
    flags
        .iter()
        .map(|state| (state.feature.name.clone(), raw_flag(state, Reason::Static)))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::FlagsmithApi;
    use crate::{Error, EvaluationContext};

    #[tokio::test]
    async fn identify_sends_traits_and_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/identities/"))
            .and(header("X-Environment-Key", "ser.test"))
            .and(body_partial_json(json!({
                "identifier": "alice",
                "traits": [{"trait_key": "userId", "trait_value": "alice"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "identifier": "alice",
                "flags": [
                    {"feature": {"id": 1, "name": "new-badge"}, "enabled": true, "feature_state_value": true}
                ],
                "traits": [{"trait_key": "userId", "trait_value": "alice"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = FlagsmithApi::new(&format!("{}/api/v1", server.uri()), "ser.test").unwrap();
        let flags = api
            .identify("alice", &EvaluationContext::new("alice").attributes())
            .await
            .unwrap();
        assert_eq!(flags["new-badge"].value, json!(true));
    }

    #[tokio::test]
    async fn rejected_key_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identities/"))
            .and(header("X-Environment-Key", "revoked"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/identities/"))
            .and(header("X-Environment-Key", "good"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let traits = EvaluationContext::default().attributes();
        let revoked = FlagsmithApi::new(&server.uri(), "revoked").unwrap();
        assert!(matches!(
            revoked.identify("anonymous", &traits).await,
            Err(Error::UnexpectedStatus { service: "flagsmith", status: 401 })
        ));

        let good = FlagsmithApi::new(&server.uri(), "good").unwrap();
        assert!(matches!(
            good.identify("anonymous", &traits).await,
            Err(Error::UnexpectedStatus { status: 502, .. })
        ));
    }
}
