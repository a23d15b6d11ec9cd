//! The directory of providers a user can choose from.

use std::{collections::HashSet, fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    document::directory_url,
    providers::{flagsmith, FlagdProvider, FlagsmithProvider, GrowthBookProvider},
    DocumentBase, DocumentLoader, Error, FlagsmithMode, Provider, Result, Settings,
};

/// Provider used when no valid choice is available.
pub const DEFAULT_PROVIDER: &str = "flagd";

/// Key under which the chosen provider id is persisted.
pub const PROVIDER_STORAGE_KEY: &str = "providerChoice";

/// Future returned by [`ProviderDescriptor::init`].
pub type ProviderFuture = BoxFuture<'static, Result<Arc<dyn Provider>>>;

/// Describes a provider and how to build it.
#[derive(Clone, Copy)]
pub struct ProviderDescriptor {
    /// Stable identifier, persisted as the user's choice.
    pub id: &'static str,
    /// Short human-readable name.
    pub label: &'static str,
    /// One-line description shown when choosing.
    pub description: &'static str,
    /// Build the provider. May fetch documents but does not initialize the provider.
    pub init: fn(Settings) -> ProviderFuture,
    /// Check that `settings` allow building the provider, without touching the network.
    pub validate: fn(&Settings) -> Result<()>,
}

impl ProviderDescriptor {
    /// Build the provider with `settings`.
    pub fn build(&self, settings: Settings) -> ProviderFuture {
        (self.init)(settings)
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ProviderDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

static BUILTIN: [ProviderDescriptor; 3] = [
    ProviderDescriptor {
        id: "flagd",
        label: "flagd (local file via flagd)",
        description: "Reads flags from your local flagd daemon (JSON).",
        init: init_flagd,
        validate: validate_flagd,
    },
    ProviderDescriptor {
        id: "growthbook",
        label: "GrowthBook (offline JSON)",
        description: "Evaluates flags locally from /growthbook/features.json.",
        init: init_growthbook,
        validate: validate_documents,
    },
    ProviderDescriptor {
        id: "flagsmith",
        label: "Flagsmith (bootstrap/offline)",
        description: "Evaluates via Flagsmith Hosted API using your Environment ID.",
        init: init_flagsmith,
        validate: validate_flagsmith,
    },
];

fn init_flagd(settings: Settings) -> ProviderFuture {
    Box::pin(async move {
        let provider = FlagdProvider::new(settings.flagd())?;
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}

fn init_growthbook(settings: Settings) -> ProviderFuture {
    Box::pin(async move {
        let loader = DocumentLoader::new(DocumentBase::parse(settings.documents())?);
        let provider = GrowthBookProvider::load(&loader).await?;
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}

fn init_flagsmith(settings: Settings) -> ProviderFuture {
    Box::pin(async move {
        let loader = DocumentLoader::new(DocumentBase::parse(settings.documents())?);
        let provider = FlagsmithProvider::load(settings.flagsmith(), &loader).await?;
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}

fn validate_flagd(settings: &Settings) -> Result<()> {
    let flagd = settings.flagd();
    if flagd.host.trim().is_empty() {
        return Err(Error::MissingConfiguration("FLAGD_HOST"));
    }
    Ok(())
}

fn validate_documents(settings: &Settings) -> Result<()> {
    DocumentBase::parse(settings.documents()).map(|_| ())
}

fn validate_flagsmith(settings: &Settings) -> Result<()> {
    let flagsmith = settings.flagsmith();
    match flagsmith.mode {
        FlagsmithMode::Offline => validate_documents(settings),
        FlagsmithMode::Online => {
            flagsmith::validate_online(flagsmith)?;
            directory_url(&flagsmith.api_url)?;
            if flagsmith.realtime {
                directory_url(&flagsmith.realtime_url)?;
            }
            Ok(())
        }
    }
}

/// A fixed set of [`ProviderDescriptor`]s keyed by id, with a default.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<ProviderDescriptor>,
    default_index: usize,
}

impl Registry {
    /// The built-in providers: flagd (the default), GrowthBook and Flagsmith.
    pub fn builtin() -> Self {
        Registry {
            descriptors: BUILTIN.to_vec(),
            default_index: 0,
        }
    }

    /// Create a registry of `descriptors` defaulting to `default_id`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRegistry`] if ids are duplicated or `default_id` is not among them.
    pub fn new(descriptors: Vec<ProviderDescriptor>, default_id: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = descriptors.iter().find(|d| !seen.insert(d.id)) {
            return Err(Error::InvalidRegistry(format!(
                "duplicate provider id {:?}",
                duplicate.id
            )));
        }
        let default_index = descriptors
            .iter()
            .position(|d| d.id == default_id)
            .ok_or_else(|| {
                Error::InvalidRegistry(format!("default provider {:?} is not registered", default_id))
            })?;
        Ok(Registry {
            descriptors,
            default_index,
        })
    }

    /// All descriptors, in display order.
    pub fn descriptors(&self) -> &[ProviderDescriptor] {
        &self.descriptors
    }

    /// The default descriptor.
    pub fn default_descriptor(&self) -> &ProviderDescriptor {
        &self.descriptors[self.default_index]
    }

    /// The descriptor registered as `id`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownProvider`] if no descriptor has this id.
    pub fn get(&self, id: &str) -> Result<&ProviderDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::UnknownProvider(id.to_owned()))
    }

    /// The descriptor registered as `id`, or the default one if there is none.
    pub fn lookup(&self, id: &str) -> &ProviderDescriptor {
        self.get(id).unwrap_or_else(|_| {
            log::debug!(target: "flagswitch", id; "unknown provider, using default");
            self.default_descriptor()
        })
    }

    /// Descriptors whose settings validate, i.e. the ones that may be offered for selection.
    pub fn available(&self, settings: &Settings) -> Vec<&ProviderDescriptor> {
        self.descriptors
            .iter()
            .filter(|descriptor| match (descriptor.validate)(settings) {
                Ok(()) => true,
                Err(err) => {
                    log::info!(target: "flagswitch", provider = descriptor.id; "provider unavailable: {}", err);
                    false
                }
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}
