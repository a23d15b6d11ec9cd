//! The selection gate: nothing is built until a provider has been chosen and persisted.

use crate::{
    registry::PROVIDER_STORAGE_KEY, ChoiceStore, Error, ProviderDescriptor, Registry, Result,
    Settings,
};

/// Asks the user to pick one of the offered providers.
pub trait ChoicePrompt {
    /// Present `options` and return the chosen provider id, or `None` if the user cancelled.
    fn choose(&mut self, options: &[&ProviderDescriptor]) -> Result<Option<String>>;
}

impl<T: FnMut(&[&ProviderDescriptor]) -> Result<Option<String>>> ChoicePrompt for T {
    fn choose(&mut self, options: &[&ProviderDescriptor]) -> Result<Option<String>> {
        self(options)
    }
}

/// Resolves which provider to use, prompting when no choice has been persisted.
pub struct ProviderSelector {
    registry: Registry,
    store: Box<dyn ChoiceStore>,
    settings: Settings,
}

impl ProviderSelector {
    /// Create a selector offering `registry`'s providers, persisting choices in `store`.
    pub fn new(registry: Registry, store: impl ChoiceStore + 'static, settings: Settings) -> Self {
        ProviderSelector {
            registry,
            store: Box::new(store),
            settings,
        }
    }

    /// The registry choices are made from.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Settings providers are validated and built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The persisted provider id, if any. An unreadable store counts as no choice.
    pub fn persisted_choice(&self) -> Option<String> {
        match self.store.get(PROVIDER_STORAGE_KEY) {
            Ok(choice) => choice.filter(|id| !id.trim().is_empty()),
            Err(err) => {
                log::warn!(target: "flagswitch", "failed to read persisted provider choice: {}", err);
                None
            }
        }
    }

    /// Return the chosen provider, prompting for one and persisting it if none is stored yet.
    ///
    /// A persisted id that is no longer registered resolves to the default provider.
    ///
    /// # Errors
    ///
    /// - [`Error::SelectionCancelled`] if the prompt returns no choice.
    /// - [`Error::UnknownProvider`] if the prompt returns an id that is not registered.
    /// - The provider's validation error if its settings are unusable.
    /// - Store errors if the choice cannot be persisted.
    pub fn ensure_choice(&self, prompt: &mut dyn ChoicePrompt) -> Result<ProviderDescriptor> {
        if let Some(id) = self.persisted_choice() {
            let descriptor = self.registry.lookup(&id);
            log::debug!(target: "flagswitch", persisted = id.as_str(), provider = descriptor.id; "using persisted provider choice");
            return Ok(*descriptor);
        }

        let options = self.registry.available(&self.settings);
        let id = prompt.choose(&options)?.ok_or(Error::SelectionCancelled)?;
        let descriptor = self.registry.get(id.trim())?;
        (descriptor.validate)(&self.settings)?;

        self.store.set(PROVIDER_STORAGE_KEY, descriptor.id)?;
        log::info!(target: "flagswitch", provider = descriptor.id; "provider chosen");
        Ok(*descriptor)
    }

    /// Forget the persisted choice so that the next [`ProviderSelector::ensure_choice`] prompts
    /// again.
    pub fn switch_provider(&self) -> Result<()> {
        log::info!(target: "flagswitch", "clearing provider choice");
        self.store.remove(PROVIDER_STORAGE_KEY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ChoicePrompt, ProviderSelector};
    use crate::{
        registry::PROVIDER_STORAGE_KEY, ChoiceStore, Error, FileChoiceStore, FlagsmithMode,
        MemoryChoiceStore, ProviderDescriptor, Registry, Result, Settings,
    };

    fn answer(id: &'static str) -> impl FnMut(&[&ProviderDescriptor]) -> Result<Option<String>> {
        move |_: &[&ProviderDescriptor]| Ok(Some(id.to_owned()))
    }

    fn selector(store: impl ChoiceStore + 'static) -> ProviderSelector {
        ProviderSelector::new(Registry::builtin(), store, Settings::new())
    }

    #[test]
    fn prompts_once_then_uses_persisted_choice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let selector = selector(FileChoiceStore::new(&path));

        let mut prompts = 0;
        let mut prompt = |options: &[&ProviderDescriptor]| -> Result<Option<String>> {
            prompts += 1;
            assert_eq!(options.len(), 3);
            Ok(Some("flagd".to_owned()))
        };
        assert_eq!(selector.ensure_choice(&mut prompt).unwrap().id, "flagd");
        assert_eq!(selector.ensure_choice(&mut prompt).unwrap().id, "flagd");
        drop(prompt);
        assert_eq!(prompts, 1);

        let stored = FileChoiceStore::new(&path).get(PROVIDER_STORAGE_KEY).unwrap();
        assert_eq!(stored.as_deref(), Some("flagd"));
    }

    #[test]
    fn switch_clears_choice() {
        let selector = selector(MemoryChoiceStore::new());
        selector.ensure_choice(&mut answer("growthbook")).unwrap();
        assert_eq!(selector.persisted_choice().as_deref(), Some("growthbook"));

        selector.switch_provider().unwrap();
        assert_eq!(selector.persisted_choice(), None);
        assert_eq!(selector.ensure_choice(&mut answer("flagsmith")).unwrap().id, "flagsmith");
    }

    #[test]
    fn rejects_unknown_and_cancelled() {
        let selector = selector(MemoryChoiceStore::new());
        assert!(matches!(
            selector.ensure_choice(&mut answer("launchdarkly")),
            Err(Error::UnknownProvider(_))
        ));
        let mut cancel = |_: &[&ProviderDescriptor]| -> Result<Option<String>> { Ok(None) };
        assert!(matches!(
            selector.ensure_choice(&mut cancel),
            Err(Error::SelectionCancelled)
        ));
        assert_eq!(selector.persisted_choice(), None);
    }

    #[test]
    fn stale_persisted_id_resolves_to_default() {
        let store = MemoryChoiceStore::new();
        store.set(PROVIDER_STORAGE_KEY, "optimizely").unwrap();
        let selector = selector(store);
        let mut never: Box<dyn ChoicePrompt> =
            Box::new(|_: &[&ProviderDescriptor]| -> Result<Option<String>> {
                panic!("should not prompt")
            });
        assert_eq!(selector.ensure_choice(never.as_mut()).unwrap().id, "flagd");
    }

    #[test]
    fn misconfigured_provider_cannot_be_chosen() {
        let settings = Settings::new().flagsmith_mode(FlagsmithMode::Online);
        let selector = ProviderSelector::new(
            Registry::builtin(),
            Arc::new(MemoryChoiceStore::new()),
            settings,
        );
        let mut offered = Vec::new();
        let mut prompt = |options: &[&ProviderDescriptor]| -> Result<Option<String>> {
            offered = options.iter().map(|d| d.id).collect::<Vec<_>>();
            Ok(Some("flagsmith".to_owned()))
        };
        assert!(matches!(
            selector.ensure_choice(&mut prompt),
            Err(Error::MissingConfiguration("FLAGSMITH_ENVIRONMENT_ID"))
        ));
        drop(prompt);
        assert_eq!(offered, vec!["flagd", "growthbook"]);
        assert_eq!(selector.persisted_choice(), None);
    }
}
