//! GrowthBook provider.
//!
//! Evaluates a static GrowthBook features document locally. Each feature resolves to the `force`
//! value of the first applicable rule, or to its `defaultValue`. Experiment rules (rules without
//! `force`) and partial coverage need hashing and are skipped.

mod condition;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    flag_store::{FlagSnapshot, FlagStore, RawFlag},
    DocumentLoader, EvaluationContext, Provider, ProviderMetadata, Reason, ResolutionDetails,
    Result,
};

use condition::eval_condition;

/// Path of the features document relative to the documents base.
pub const FEATURES_DOCUMENT: &str = "growthbook/features.json";

/// A GrowthBook feature definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Value served when no rule applies.
    #[serde(default)]
    pub default_value: Value,
    /// Rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<FeatureRule>,
}

/// A rule of a [`Feature`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRule {
    /// Attribute condition; a rule without one applies to everybody.
    #[serde(default)]
    pub condition: Option<Value>,
    /// Value to serve when the rule applies.
    #[serde(default)]
    pub force: Option<Value>,
    /// Share of users the rule applies to.
    #[serde(default)]
    pub coverage: Option<f64>,
}

impl FeatureRule {
    fn applies(&self, attributes: &Map<String, Value>) -> bool {
        if self.force.is_none() {
            log::trace!(target: "flagswitch", "skipping GrowthBook rule without force value");
            return false;
        }
        if self.coverage.is_some_and(|coverage| coverage < 1.0) {
            log::trace!(target: "flagswitch", "skipping GrowthBook rule with partial coverage");
            return false;
        }
        self.condition
            .as_ref()
            .map_or(true, |condition| eval_condition(attributes, condition))
    }
}

impl Feature {
    /// Evaluate the feature for `attributes`.
    fn eval(&self, attributes: &Map<String, Value>) -> RawFlag {
        match self.rules.iter().find(|rule| rule.applies(attributes)) {
            Some(FeatureRule {
                force: Some(value), ..
            }) => RawFlag::new(value.clone(), Reason::TargetingMatch),
            _ => RawFlag::new(self.default_value.clone(), Reason::Static),
        }
    }
}

/// The features document: either a bare map of features or the API payload wrapping it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeaturesDocument {
    /// `{"features": {...}}`, as returned by the GrowthBook features endpoint.
    Wrapped {
        /// Features keyed by flag key.
        features: HashMap<String, Feature>,
    },
    /// A map of features keyed by flag key.
    Bare(HashMap<String, Feature>),
}

impl FeaturesDocument {
    fn into_features(self) -> HashMap<String, Feature> {
        match self {
            FeaturesDocument::Wrapped { features } | FeaturesDocument::Bare(features) => features,
        }
    }
}

/// A provider evaluating a GrowthBook features document.
pub struct GrowthBookProvider {
    metadata: ProviderMetadata,
    features: HashMap<String, Feature>,
    attributes: RwLock<Map<String, Value>>,
    store: FlagStore,
    initialized: AtomicBool,
}

impl GrowthBookProvider {
    /// Create a provider for `features`.
    pub fn new(features: FeaturesDocument) -> Self {
        let provider = GrowthBookProvider {
            metadata: ProviderMetadata::new("growthbook"),
            features: features.into_features(),
            attributes: RwLock::new(Map::new()),
            store: FlagStore::new(),
            initialized: AtomicBool::new(false),
        };
        provider.recompute();
        provider
    }

    /// Fetch [`FEATURES_DOCUMENT`] through `loader` and create a provider for it.
    ///
    /// # Errors
    ///
    /// Fails if the document cannot be fetched or parsed; there is no fallback to an empty feature
    /// set.
    pub async fn load(loader: &DocumentLoader) -> Result<Self> {
        let features: FeaturesDocument = loader.load(FEATURES_DOCUMENT).await.inspect_err(|err| {
            log::warn!(target: "flagswitch", "failed to load GrowthBook features: {}", err);
        })?;
        Ok(GrowthBookProvider::new(features))
    }

    fn set_attributes(&self, context: &EvaluationContext) {
        let attributes = context.attributes();
        match self.attributes.write() {
            Ok(mut slot) => *slot = attributes,
            Err(poisoned) => *poisoned.into_inner() = attributes,
        }
        self.recompute();
    }

    fn recompute(&self) {
        let attributes = match self.attributes.read() {
            Ok(attributes) => attributes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let snapshot: FlagSnapshot = self
            .features
            .iter()
            .map(|(key, feature)| (key.clone(), feature.eval(&attributes)))
            .collect();
        self.store.replace(snapshot);
    }
}

#[async_trait]
impl Provider for GrowthBookProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn initialize(&self, context: &EvaluationContext) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flagswitch", "growthbook provider already initialized");
            return Ok(());
        }
        self.set_attributes(context);
        log::debug!(target: "flagswitch", features = self.features.len(); "growthbook provider initialized");
        Ok(())
    }

    async fn on_context_change(
        &self,
        _old: &EvaluationContext,
        new: &EvaluationContext,
    ) -> Result<()> {
        self.set_attributes(new);
        Ok(())
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

    use super::{FeaturesDocument, GrowthBookProvider};
    use crate::{EvaluationContext, Provider, Reason};

    fn provider() -> GrowthBookProvider {
        let document: FeaturesDocument = serde_json::from_value(json!({
            "new-badge": {
                "defaultValue": false,
                "rules": [
                    {"condition": {"userId": "alice"}, "force": true},
                    {"variations": [false, true], "coverage": 1.0}
                ]
            },
            "cta-color": {
                "defaultValue": "blue",
                "rules": [{"condition": {"userId": {"$in": ["bob"]}}, "force": "green"}]
            },
            "max-items": {"defaultValue": "12"},
            "rollout": {"defaultValue": 1, "rules": [{"force": 2, "coverage": 0.5}]}
        }))
        .unwrap();
        GrowthBookProvider::new(document)
    }

    #[tokio::test]
    async fn forced_rule_follows_context() {
        let provider = provider();
        let anonymous = EvaluationContext::default();
        let alice = EvaluationContext::new("alice");
        provider.initialize(&anonymous).await.unwrap();

        let before = provider.resolve_boolean_evaluation("new-badge", true);
        assert!(!before.value);
        assert_eq!(before.reason, Reason::Static);

        provider.on_context_change(&anonymous, &alice).await.unwrap();
        let after = provider.resolve_boolean_evaluation("new-badge", false);
        assert!(after.value);
        assert_eq!(after.reason, Reason::TargetingMatch);
        assert_eq!(provider.resolve_string_evaluation("cta-color", "red").value, "blue");
    }

    #[tokio::test]
    async fn coercion_and_defaults() {
        let provider = provider();
        provider.initialize(&EvaluationContext::new("bob")).await.unwrap();

        assert_eq!(provider.resolve_string_evaluation("cta-color", "blue").value, "green");
        assert_eq!(provider.resolve_number_evaluation("max-items", 5.0).value, 12.0);
        assert_eq!(provider.resolve_number_evaluation("rollout", 0.0).value, 1.0);

        let missing = provider.resolve_object_evaluation("missing", &json!({"a": 1}));
        assert_eq!(missing.value, json!({"a": 1}));
        assert_eq!(missing.reason, Reason::Default);
    }

    #[test]
    fn accepts_wrapped_document() {
        let document: FeaturesDocument = serde_json::from_value(json!({
            "status": 200,
            "features": {"new-badge": {"defaultValue": true}}
        }))
        .unwrap();
        let provider = GrowthBookProvider::new(document);
        assert!(provider.resolve_boolean_evaluation("new-badge", false).value);
    }
}
