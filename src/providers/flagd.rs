//! flagd provider.
//!
//! Reads flags from a flagd daemon through its HTTP/JSON evaluation API. Every identity change
//! issues one `ResolveAll` call and caches the typed results; resolver calls read the cache.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    flag_store::{FlagSnapshot, FlagStore, RawFlag},
    EvaluationContext, Error, FlagdSettings, Provider, ProviderMetadata, Reason,
    ResolutionDetails, Result,
};

const RESOLVE_ALL_ENDPOINT: &str = "flagd.evaluation.v1.Service/ResolveAll";

/// A provider backed by a flagd daemon.
pub struct FlagdProvider {
    metadata: ProviderMetadata,
    client: reqwest::Client,
    resolve_all_url: Url,
    store: FlagStore,
    initialized: AtomicBool,
}

#[derive(Debug, Serialize)]
struct ResolveAllRequest {
    context: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResolveAllResponse {
    #[serde(default)]
    flags: HashMap<String, AnyFlag>,
}

/// One entry of a `ResolveAll` response. Exactly one of the typed value fields is set.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnyFlag {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    bool_value: Option<bool>,
    #[serde(default)]
    string_value: Option<String>,
    #[serde(default)]
    double_value: Option<f64>,
    #[serde(default)]
    object_value: Option<Value>,
}

impl AnyFlag {
    fn into_raw(self) -> RawFlag {
        let value = if let Some(b) = self.bool_value {
            Value::Bool(b)
        } else if let Some(s) = self.string_value {
            Value::String(s)
        } else if let Some(n) = self.double_value {
            serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
        } else {
            self.object_value.unwrap_or(Value::Null)
        };
        let reason = self
            .reason
            .as_deref()
            .map_or(Reason::Static, Reason::from_vendor);
        RawFlag {
            value,
            variant: self.variant.filter(|v| !v.is_empty()),
            reason,
        }
    }
}

impl FlagdProvider {
    /// Create a provider for the daemon described by `settings`. No connection is made until
    /// [`Provider::initialize`].
    pub fn new(settings: &FlagdSettings) -> Result<Self> {
        let scheme = if settings.tls { "https" } else { "http" };
        let base = Url::parse(&format!("{}://{}:{}/", scheme, settings.host, settings.port))
            .map_err(Error::InvalidBaseUrl)?;
        let resolve_all_url = base
            .join(RESOLVE_ALL_ENDPOINT)
            .map_err(Error::InvalidBaseUrl)?;

        Ok(FlagdProvider {
            metadata: ProviderMetadata::new("flagd"),
            client: reqwest::Client::new(),
            resolve_all_url,
            store: FlagStore::new(),
            initialized: AtomicBool::new(false),
        })
    }

    async fn resolve_all(&self, context: &EvaluationContext) -> Result<()> {
        let mut attributes = context.attributes();
        attributes.insert(
            "targetingKey".to_owned(),
            Value::String(context.user_id().to_owned()),
        );

        log::debug!(target: "flagswitch", user_id = context.user_id(); "resolving all flags from flagd");
        let response = self
            .client
            .post(self.resolve_all_url.clone())
            .json(&ResolveAllRequest {
                context: attributes,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagswitch", "flagd responded with {}", status);
            return Err(Error::UnexpectedStatus {
                service: "flagd",
                status: status.as_u16(),
            });
        }

        let body: ResolveAllResponse = response.json().await?;
        let snapshot: FlagSnapshot = body
            .flags
            .into_iter()
            .map(|(key, flag)| (key, flag.into_raw()))
            .collect();

        let changed = self.store.replace(snapshot);
        log::debug!(target: "flagswitch", changed = changed.len(); "flagd flags updated");
        Ok(())
    }
}

#[async_trait]
impl Provider for FlagdProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn initialize(&self, context: &EvaluationContext) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flagswitch", "flagd provider already initialized");
            return Ok(());
        }
        self.resolve_all(context).await.inspect_err(|_| {
            self.initialized.store(false, Ordering::SeqCst);
        })
    }

    async fn on_context_change(
        &self,
        _old: &EvaluationContext,
        new: &EvaluationContext,
    ) -> Result<()> {
        self.resolve_all(new).await
    }

    fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
    ) -> ResolutionDetails<bool> {
        self.store.resolve_boolean(flag_key, default_value)
    }

    fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: &str,
    ) -> ResolutionDetails<String> {
        self.store.resolve_string(flag_key, default_value)
    }

    fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
    ) -> ResolutionDetails<f64> {
        self.store.resolve_number(flag_key, default_value)
    }

    fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: &Value,
    ) -> ResolutionDetails<Value> {
        self.store.resolve_object(flag_key, default_value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AnyFlag, FlagdProvider, ResolveAllResponse};
    use crate::{FlagdSettings, Reason};

    #[test]
    fn builds_resolve_all_url() {
        let provider = FlagdProvider::new(&FlagdSettings {
            host: "localhost".into(),
            port: 8013,
            tls: false,
        })
        .unwrap();
        assert_eq!(
            provider.resolve_all_url.as_str(),
            "http://localhost:8013/flagd.evaluation.v1.Service/ResolveAll"
        );
    }

    #[test]
    fn parses_typed_values() {
        let response: ResolveAllResponse = serde_json::from_value(json!({
            "flags": {
                "new-badge": {"reason": "TARGETING_MATCH", "variant": "on", "boolValue": true},
                "cta-color": {"reason": "STATIC", "variant": "blue", "stringValue": "blue"},
                "discount": {"reason": "STATIC", "doubleValue": 0.0},
                "layout": {"objectValue": {"columns": 2}}
            }
        }))
        .unwrap();

        let mut flags = response.flags;
        let badge = flags.remove("new-badge").unwrap().into_raw();
        assert_eq!(badge.value, json!(true));
        assert_eq!(badge.reason, Reason::TargetingMatch);
        assert_eq!(badge.variant.as_deref(), Some("on"));

        assert_eq!(flags.remove("discount").unwrap().into_raw().value, json!(0.0));
        let layout = flags.remove("layout").unwrap().into_raw();
        assert_eq!(layout.value, json!({"columns": 2}));
        assert_eq!(layout.reason, Reason::Static);
    }

    #[test]
    fn empty_flag_has_no_value() {
        assert!(AnyFlag::default().into_raw().value.is_null());
    }
}
