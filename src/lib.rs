//! flagswitch lets a user pick one of several feature-flag providers (flagd, GrowthBook, Flagsmith)
//! and evaluates flags through a single OpenFeature-style contract, whichever vendor is active.
//!
//! # Overview
//!
//! Every vendor adapter implements [`Provider`]. Resolver calls such as
//! [`Provider::resolve_boolean_evaluation`] never fail: missing, null or unusable values fall back
//! to the caller's default following one coercion policy shared by all adapters (see [`coerce`]).
//!
//! A [`ProviderSelector`] gates startup: until a choice has been persisted in a [`ChoiceStore`],
//! nothing is built and the user is asked to pick one of the [`Registry`]'s providers. A
//! [`FlagSession`] then owns the chosen provider, pushes the current user to it through
//! [`FlagSession::refresh`] and keeps the [`FrontendFlags`] snapshot up to date, including on
//! [`ProviderEvent`]s emitted by providers that know when their values change.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Configuration errors surface before any network activity. Flag reads never return errors, and a
//! failing backend call never fails a refresh.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `flagswitch` target, with structured key-values. The `flagswitch` binary installs
//! `env_logger`, configured through `RUST_LOG`.
//!
//! # Examples
//!
//! ```no_run
//! # async fn run() -> flagswitch::Result<()> {
//! use flagswitch::{
//!     BackendClient, FileChoiceStore, FlagSession, ProviderDescriptor, ProviderSelector, Registry,
//!     Settings,
//! };
//!
//! let settings = Settings::from_env()?;
//! let selector = ProviderSelector::new(
//!     Registry::builtin(),
//!     FileChoiceStore::new(settings.state_path()),
//!     settings.clone(),
//! );
//! let mut prompt = |_: &[&ProviderDescriptor]| -> flagswitch::Result<Option<String>> {
//!     Ok(Some("growthbook".to_owned()))
//! };
//! let descriptor = selector.ensure_choice(&mut prompt)?;
//!
//! let backend = BackendClient::new(settings.backend())?;
//! let mut session = FlagSession::start(descriptor, settings, backend).await?;
//! let flags = session.refresh("alice").await?;
//! println!("new badge: {}, cta color: {}", flags.new_badge, flags.cta_color);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod backend;
pub mod coerce;
mod config;
mod context;
mod document;
mod error;
mod events;
mod flag_store;
mod provider;
pub mod providers;
mod registry;
mod resolution;
mod selector;
mod session;
mod storage;

pub use backend::BackendClient;
pub use config::{FlagdSettings, FlagsmithMode, FlagsmithSettings, Settings};
pub use context::{EvaluationContext, USER_ID_ATTRIBUTE};
pub use document::{DocumentBase, DocumentLoader};
pub use error::{Error, Result};
pub use events::{EventBus, EventHandler, HandlerId, ProviderEvent, ProviderEventKind};
pub use provider::{Provider, ProviderMetadata};
pub use providers::{FlagdProvider, FlagsmithProvider, GrowthBookProvider};
pub use registry::{
    ProviderDescriptor, ProviderFuture, Registry, DEFAULT_PROVIDER, PROVIDER_STORAGE_KEY,
};
pub use resolution::{Reason, ResolutionDetails};
pub use selector::{ChoicePrompt, ProviderSelector};
pub use session::{FlagSession, FrontendFlags, CTA_COLOR_FLAG, NEW_BADGE_FLAG};
pub use storage::{ChoiceStore, FileChoiceStore, MemoryChoiceStore};
