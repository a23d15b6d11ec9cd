//! The flag session: one active provider, the current user and the flags the front-end shows.

use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    BackendClient, ChoicePrompt, EvaluationContext, HandlerId, Provider, ProviderDescriptor,
    ProviderEvent, ProviderEventKind, ProviderSelector, Result, Settings,
};

/// Key of the boolean flag showing the "new" badge.
pub const NEW_BADGE_FLAG: &str = "new-badge";
/// Key of the string flag choosing the call-to-action color.
pub const CTA_COLOR_FLAG: &str = "cta-color";

const NEW_BADGE_DEFAULT: bool = false;
const CTA_COLOR_DEFAULT: &str = "blue";

/// Flag values as the front-end renders them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendFlags {
    /// Whether to show the "new" badge.
    pub new_badge: bool,
    /// Color of the call-to-action button.
    pub cta_color: String,
    /// Name of the provider the values came from.
    pub provider: String,
    /// User the values were evaluated for.
    pub user_id: String,
    /// When the values were read.
    pub refreshed_at: DateTime<Utc>,
}

impl FrontendFlags {
    /// Read the front-end flags from `provider` for `user_id`.
    pub fn read(provider: &dyn Provider, user_id: &str) -> Self {
        FrontendFlags {
            new_badge: provider
                .resolve_boolean_evaluation(NEW_BADGE_FLAG, NEW_BADGE_DEFAULT)
                .value,
            cta_color: provider
                .resolve_string_evaluation(CTA_COLOR_FLAG, CTA_COLOR_DEFAULT)
                .value,
            provider: provider.metadata().name.clone(),
            user_id: user_id.to_owned(),
            refreshed_at: Utc::now(),
        }
    }
}

/// Owns the active provider and drives it for the current user.
///
/// Flag values are re-read after every [`FlagSession::refresh`] and whenever the provider reports
/// [`ProviderEventKind::Ready`] or [`ProviderEventKind::ConfigurationChanged`].
pub struct FlagSession {
    descriptor: ProviderDescriptor,
    settings: Settings,
    provider: Arc<dyn Provider>,
    context: Arc<RwLock<EvaluationContext>>,
    flags: Arc<RwLock<FrontendFlags>>,
    backend: BackendClient,
    handlers: Vec<(ProviderEventKind, HandlerId)>,
}

impl FlagSession {
    /// Build and initialize `descriptor`'s provider for the anonymous user.
    ///
    /// # Errors
    ///
    /// Fails if the provider cannot be built or initialized. Backend failures are never errors.
    pub async fn start(
        descriptor: ProviderDescriptor,
        settings: Settings,
        backend: BackendClient,
    ) -> Result<FlagSession> {
        log::info!(target: "flagswitch", provider = descriptor.id; "starting flag session");
        let provider = descriptor.build(settings.clone()).await?;

        let context = EvaluationContext::default();
        let flags = FrontendFlags::read(provider.as_ref(), context.user_id());
        let mut session = FlagSession {
            descriptor,
            settings,
            provider,
            context: Arc::new(RwLock::new(context.clone())),
            flags: Arc::new(RwLock::new(flags)),
            backend,
            handlers: Vec::new(),
        };

        session.subscribe();
        if let Err(err) = session.provider.initialize(&context).await {
            log::warn!(target: "flagswitch", provider = descriptor.id; "failed to initialize provider: {}", err);
            session.unsubscribe();
            return Err(err);
        }

        session.reread();
        session.sync_backend(context.user_id());
        Ok(session)
    }

    /// Identify as `user_id`, then re-read the flags.
    ///
    /// The backend is told about the new user in the background; its failures are logged and
    /// otherwise ignored.
    ///
    /// # Errors
    ///
    /// Fails only if the provider cannot switch context. The previous flags stay in place then.
    pub async fn refresh(&mut self, user_id: &str) -> Result<FrontendFlags> {
        let new = EvaluationContext::new(user_id);
        let old = replace_context(&self.context, new.clone());

        if let Err(err) = self.provider.on_context_change(&old, &new).await {
            log::warn!(target: "flagswitch", user_id = new.user_id(); "failed to change context: {}", err);
            replace_context(&self.context, old);
            return Err(err);
        }

        let flags = self.reread();
        self.sync_backend(new.user_id());
        Ok(flags)
    }

    /// The flags as last read.
    pub fn flags(&self) -> FrontendFlags {
        match self.flags.read() {
            Ok(flags) => flags.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The current evaluation context.
    pub fn context(&self) -> EvaluationContext {
        read_context(&self.context)
    }

    /// The active provider.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// The descriptor the active provider was built from.
    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    /// Stop listening to the provider and shut it down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.unsubscribe();
        log::debug!(target: "flagswitch", provider = self.descriptor.id; "shutting down provider");
        self.provider.shutdown().await
    }

    /// Shut this session down, forget the persisted choice, run the selection gate again and start
    /// a session with the newly chosen provider.
    pub async fn switch_provider(
        mut self,
        selector: &ProviderSelector,
        prompt: &mut dyn ChoicePrompt,
    ) -> Result<FlagSession> {
        self.shutdown().await?;
        selector.switch_provider()?;
        let descriptor = selector.ensure_choice(prompt)?;
        FlagSession::start(descriptor, self.settings.clone(), self.backend.clone()).await
    }

    fn subscribe(&mut self) {
        let Some(events) = self.provider.events() else {
            return;
        };
        for kind in [ProviderEventKind::Ready, ProviderEventKind::ConfigurationChanged] {
            // The provider owns the bus, so handlers must not keep it alive.
            let provider: Weak<dyn Provider> = Arc::downgrade(&self.provider);
            let context = Arc::clone(&self.context);
            let flags = Arc::clone(&self.flags);
            let id = events.add_handler(kind, move |event: &ProviderEvent| {
                let Some(provider) = provider.upgrade() else {
                    return;
                };
                log::debug!(target: "flagswitch",
                            provider = event.provider.as_str(),
                            changed = event.flags_changed.len();
                            "re-reading flags after {:?}", event.kind);
                let user_id = read_context(&context).user_id().to_owned();
                store_flags(&flags, FrontendFlags::read(provider.as_ref(), &user_id));
            });
            self.handlers.push((kind, id));
        }
    }

    fn unsubscribe(&mut self) {
        let handlers = std::mem::take(&mut self.handlers);
        if let Some(events) = self.provider.events() {
            for (kind, id) in handlers {
                events.remove_handler(kind, id);
            }
        }
    }

    fn reread(&self) -> FrontendFlags {
        let user_id = read_context(&self.context).user_id().to_owned();
        let flags = FrontendFlags::read(self.provider.as_ref(), &user_id);
        store_flags(&self.flags, flags.clone());
        flags
    }

    fn sync_backend(&self, user_id: &str) {
        let backend = self.backend.clone();
        let user_id = user_id.to_owned();
        tokio::spawn(async move {
            match backend.flags(&user_id).await {
                Ok(body) => {
                    log::debug!(target: "flagswitch", user_id = user_id.as_str(); "backend flags: {}", body);
                }
                Err(err) => {
                    log::warn!(target: "flagswitch", user_id = user_id.as_str(); "backend flag sync failed: {}", err);
                }
            }
        });
    }
}

fn read_context(context: &RwLock<EvaluationContext>) -> EvaluationContext {
    match context.read() {
        Ok(context) => context.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn replace_context(slot: &RwLock<EvaluationContext>, context: EvaluationContext) -> EvaluationContext {
    match slot.write() {
        Ok(mut slot) => std::mem::replace(&mut *slot, context),
        Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), context),
    }
}

fn store_flags(slot: &RwLock<FrontendFlags>, flags: FrontendFlags) {
    match slot.write() {
        Ok(mut slot) => *slot = flags,
        Err(poisoned) => *poisoned.into_inner() = flags,
    }
}
