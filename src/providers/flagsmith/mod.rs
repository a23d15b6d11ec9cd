//! Flagsmith provider.
//!
//! Offline, flags come from a static environment document evaluated locally (segments and
//! identity overrides included), or from a bootstrap snapshot that ignores identity. Online, the
//! Flagsmith REST API identifies the user and optionally a realtime stream pushes updates.
//!
//! Either way the provider emits [`ProviderEventKind::Ready`] once after initialization and
//! [`ProviderEventKind::ConfigurationChanged`] once per identity change.

mod api;
mod engine;
mod realtime;

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

pub use engine::{
    EnvironmentDocument, FeatureRef, FeatureSegment, FeatureState, IdentityOverride, Operator,
    Project, RuleType, Segment, SegmentCondition, SegmentRule, TryParse,
};

use crate::{
    flag_store::{FlagSnapshot, FlagStore, RawFlag},
    DocumentLoader, Error, EvaluationContext, EventBus, FlagsmithMode, FlagsmithSettings,
    Provider, ProviderEvent, ProviderEventKind, ProviderMetadata, Reason, ResolutionDetails,
    Result,
};

use api::FlagsmithApi;
use realtime::{RealtimeConfig, RealtimeListener, RealtimeSink};

/// Path of the environment document relative to the documents base.
pub const ENVIRONMENT_DOCUMENT: &str = "flagsmith/environment.json";
/// Path of the bootstrap document relative to the documents base.
pub const BOOTSTRAP_DOCUMENT: &str = "flagsmith/bootstrap.json";

/// A flag of a bootstrap snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BootstrapFlag {
    /// Whether the feature is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// The feature's value.
    #[serde(default)]
    pub value: Value,
}

/// A snapshot of flag values served to every identity alike.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BootstrapDocument {
    /// A serialized client state: `{"flags": {"<key>": {"enabled": ..., "value": ...}}}`.
    State {
        /// Flags keyed by flag key.
        flags: HashMap<String, BootstrapFlag>,
    },
    /// A flags API response: `[{"feature": {"name": ...}, "feature_state_value": ...}]`.
    Features(Vec<FeatureState>),
    /// A bare map of flags keyed by flag key.
    Bare(HashMap<String, BootstrapFlag>),
}

impl BootstrapDocument {
    fn into_snapshot(self) -> FlagSnapshot {
        match self {
            BootstrapDocument::State { flags } | BootstrapDocument::Bare(flags) => flags
                .into_iter()
                .map(|(key, flag)| (key, RawFlag::new(flag.value, Reason::Static)))
                .collect(),
            BootstrapDocument::Features(states) => states
                .iter()
                .map(|state| {
                    (
                        state.feature.name.clone(),
                        engine::raw_flag(state, Reason::Static),
                    )
                })
                .collect(),
        }
    }
}

enum Source {
    Environment(EnvironmentDocument),
    Bootstrap(FlagSnapshot),
    Empty,
    Online(FlagsmithApi),
}

impl Source {
    fn describe(&self) -> &'static str {
        match self {
            Source::Environment(_) => "environment document",
            Source::Bootstrap(_) => "bootstrap snapshot",
            Source::Empty => "no flags",
            Source::Online(_) => "REST API",
        }
    }
}

/// State shared with the realtime listener.
struct Inner {
    metadata: ProviderMetadata,
    source: Source,
    store: FlagStore,
    context: RwLock<EvaluationContext>,
    // Held from fetch to store so that an update never lands after a newer identity's.
    updating: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl Inner {
    async fn fetch(&self, context: &EvaluationContext) -> Result<FlagSnapshot> {
        match &self.source {
            Source::Environment(document) => {
                Ok(document.identity_flags(context.user_id(), &context.attributes()))
            }
            Source::Bootstrap(flags) => Ok(flags.clone()),
            Source::Empty => Ok(HashMap::new()),
            Source::Online(api) => api.identify(context.user_id(), &context.attributes()).await,
        }
    }

    /// Identify as `context`, returning the keys whose value changed.
    async fn identify(&self, context: &EvaluationContext) -> Result<Vec<String>> {
        let _updating = self.updating.lock().await;
        let flags = self.fetch(context).await?;
        match self.context.write() {
            Ok(mut slot) => *slot = context.clone(),
            Err(poisoned) => *poisoned.into_inner() = context.clone(),
        }
        Ok(self.store.replace(flags))
    }

    /// Fetch the flags of whichever identity is current once no other update is in flight.
    async fn refresh_current(&self) -> Result<Vec<String>> {
        let _updating = self.updating.lock().await;
        let context = self.current_context();
        let flags = self.fetch(&context).await?;
        Ok(self.store.replace(flags))
    }

    fn current_context(&self) -> EvaluationContext {
        match self.context.read() {
            Ok(context) => context.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn emit(&self, kind: ProviderEventKind, flags_changed: Vec<String>) {
        self.events.emit(
            &ProviderEvent::new(kind, self.metadata.name.as_str()).with_flags_changed(flags_changed),
        );
    }
}

impl RealtimeSink for Inner {
    fn refetch(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.refresh_current().await {
                Ok(changed) if changed.is_empty() => {
                    log::debug!(target: "flagswitch", "realtime update did not change any flag");
                }
                Ok(changed) => {
                    log::debug!(target: "flagswitch", changed = changed.len(); "realtime update changed flags");
                    self.emit(ProviderEventKind::ConfigurationChanged, changed);
                }
                Err(err) => {
                    log::warn!(target: "flagswitch", "failed to refetch Flagsmith flags: {}", err);
                }
            }
        })
    }
}

/// A provider backed by Flagsmith.
pub struct FlagsmithProvider {
    inner: Arc<Inner>,
    realtime: Option<Url>,
    listener: Mutex<Option<RealtimeListener>>,
    initialized: AtomicBool,
}

impl FlagsmithProvider {
    fn with_source(source: Source, realtime: Option<Url>) -> Self {
        log::debug!(target: "flagswitch", source = source.describe(); "creating Flagsmith provider");
        FlagsmithProvider {
            inner: Arc::new(Inner {
                metadata: ProviderMetadata::new("flagsmith"),
                source,
                store: FlagStore::new(),
                context: RwLock::new(EvaluationContext::default()),
                updating: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
            realtime,
            listener: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Offline provider evaluating `document` locally.
    pub fn from_environment(document: EnvironmentDocument) -> Self {
        Self::with_source(Source::Environment(document), None)
    }

    /// Offline provider serving the same `document` values to every identity.
    pub fn from_bootstrap(document: BootstrapDocument) -> Self {
        Self::with_source(Source::Bootstrap(document.into_snapshot()), None)
    }

    /// Offline provider without any flags. Every resolution returns the caller's default.
    pub fn empty() -> Self {
        Self::with_source(Source::Empty, None)
    }

    /// Online provider calling the Flagsmith REST API.
    ///
    /// # Errors
    ///
    /// [`Error::MissingConfiguration`] if no environment id is configured. No request is made in
    /// that case.
    pub fn online(settings: &FlagsmithSettings) -> Result<Self> {
        let environment_id = validate_online(settings)?;
        let api = FlagsmithApi::new(&settings.api_url, environment_id)?;
        let realtime = if settings.realtime {
            Some(realtime::stream_url(
                &settings.realtime_url,
                api.environment_key(),
            )?)
        } else {
            None
        };
        Ok(Self::with_source(Source::Online(api), realtime))
    }

    /// Create the provider `settings` call for.
    ///
    /// Offline, [`ENVIRONMENT_DOCUMENT`] is tried first, then [`BOOTSTRAP_DOCUMENT`]. Failures to
    /// load either are not errors: the provider then serves no flags and every resolution falls
    /// back to the caller's default.
    pub async fn load(settings: &FlagsmithSettings, loader: &DocumentLoader) -> Result<Self> {
        if settings.mode == FlagsmithMode::Online {
            return Self::online(settings);
        }

        match loader.load::<EnvironmentDocument>(ENVIRONMENT_DOCUMENT).await {
            Ok(document) => return Ok(Self::from_environment(document)),
            Err(err) => {
                log::debug!(target: "flagswitch", "no Flagsmith environment document: {}", err);
            }
        }
        match loader.load::<BootstrapDocument>(BOOTSTRAP_DOCUMENT).await {
            Ok(document) => return Ok(Self::from_bootstrap(document)),
            Err(err) => {
                log::debug!(target: "flagswitch", "no Flagsmith bootstrap document: {}", err);
            }
        }
        Ok(Self::empty())
    }

    fn start_realtime(&self) {
        let Some(url) = &self.realtime else {
            return;
        };
        let mut listener = match self.listener.lock() {
            Ok(listener) => listener,
            Err(poisoned) => poisoned.into_inner(),
        };
        if listener.is_none() {
            log::info!(target: "flagswitch", url:display = url; "subscribing to Flagsmith realtime updates");
            let sink: Arc<dyn RealtimeSink> = Arc::clone(&self.inner) as Arc<dyn RealtimeSink>;
            *listener = Some(RealtimeListener::start(
                url.clone(),
                sink,
                RealtimeConfig::default(),
            ));
        }
    }
}

/// Check the settings online mode needs, returning the environment id.
pub(crate) fn validate_online(settings: &FlagsmithSettings) -> Result<&str> {
    settings
        .environment_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(Error::MissingConfiguration("FLAGSMITH_ENVIRONMENT_ID"))
}

#[async_trait]
impl Provider for FlagsmithProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.inner.metadata
    }

    async fn initialize(&self, context: &EvaluationContext) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flagswitch", "flagsmith provider already initialized");
            return Ok(());
        }
        self.inner.identify(context).await.inspect_err(|err| {
            log::warn!(target: "flagswitch", "failed to initialize Flagsmith: {}", err);
            self.initialized.store(false, Ordering::SeqCst);
        })?;
        self.start_realtime();
        self.inner.emit(ProviderEventKind::Ready, Vec::new());
        Ok(())
    }

    async fn on_context_change(
        &self,
        _old: &EvaluationContext,
        new: &EvaluationContext,
    ) -> Result<()> {
        let changed = self.inner.identify(new).await?;
        log::debug!(target: "flagswitch", user_id = new.user_id(), changed = changed.len(); "flagsmith identity changed");
        self.inner
            .emit(ProviderEventKind::ConfigurationChanged, changed);
        Ok(())
    }

    fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
    ) -> ResolutionDetails<bool> {
        self.inner.store.resolve_boolean(flag_key, default_value)
    }

    fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: &str,
    ) -> ResolutionDetails<String> {
        self.inner.store.resolve_string(flag_key, default_value)
    }

    fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
    ) -> ResolutionDetails<f64> {
        self.inner.store.resolve_number(flag_key, default_value)
    }

    fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: &Value,
    ) -> ResolutionDetails<Value> {
        self.inner.store.resolve_object(flag_key, default_value)
    }

    async fn shutdown(&self) -> Result<()> {
        let listener = match self.listener.lock() {
            Ok(mut listener) => listener.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut listener) = listener {
            listener.stop().await;
            log::debug!(target: "flagswitch", "stopped Flagsmith realtime listener");
        }
        Ok(())
    }

    fn events(&self) -> Option<&EventBus> {
        Some(&self.inner.events)
    }
}
