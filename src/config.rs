use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Connection settings for the flagd daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagdSettings {
    /// Daemon host.
    pub host: String,
    /// Daemon port of the evaluation API.
    pub port: u16,
    /// Whether to connect over TLS.
    pub tls: bool,
}

/// How the Flagsmith provider obtains flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsmithMode {
    /// Evaluate locally from an environment or bootstrap document.
    Offline,
    /// Call the Flagsmith REST API.
    Online,
}

/// Settings for the Flagsmith provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsmithSettings {
    /// Offline or online evaluation.
    pub mode: FlagsmithMode,
    /// Client-side environment key. Required in online mode.
    pub environment_id: Option<String>,
    /// REST API base URL.
    pub api_url: String,
    /// Whether to subscribe to realtime updates (online mode only).
    pub realtime: bool,
    /// Realtime (SSE) service base URL.
    pub realtime_url: String,
}

/// Configuration for every provider, the choice store and the backend.
///
/// # Examples
/// ```
/// # use flagswitch::{FlagsmithMode, Settings};
/// let settings = Settings::new()
///     .flagd_port(8014)
///     .documents_base("./public")
///     .flagsmith_mode(FlagsmithMode::Online)
///     .flagsmith_environment_id("ser.abc123");
/// assert_eq!(settings.flagd().port, 8014);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    flagd: FlagdSettings,
    documents_base: String,
    flagsmith: FlagsmithSettings,
    backend_url: String,
    state_file: PathBuf,
}

impl Settings {
    /// Default flagd host.
    pub const DEFAULT_FLAGD_HOST: &'static str = "localhost";
    /// Default flagd port.
    pub const DEFAULT_FLAGD_PORT: u16 = 8013;
    /// Default base for flag documents: the front-end's static asset server.
    pub const DEFAULT_DOCUMENTS_BASE: &'static str = "http://localhost:3000/";
    /// Default Flagsmith API base URL.
    pub const DEFAULT_FLAGSMITH_API_URL: &'static str = "https://edge.api.flagsmith.com/api/v1/";
    /// Default Flagsmith realtime base URL.
    pub const DEFAULT_FLAGSMITH_REALTIME_URL: &'static str = "https://realtime.flagsmith.com/";
    /// Default backend base URL.
    pub const DEFAULT_BACKEND_URL: &'static str = "http://localhost:8000";
    /// Default location of the persisted provider choice.
    pub const DEFAULT_STATE_FILE: &'static str = ".flagswitch/state.json";

    /// Create settings with all defaults.
    pub fn new() -> Self {
        Settings {
            flagd: FlagdSettings {
                host: Self::DEFAULT_FLAGD_HOST.to_owned(),
                port: Self::DEFAULT_FLAGD_PORT,
                tls: false,
            },
            documents_base: Self::DEFAULT_DOCUMENTS_BASE.to_owned(),
            flagsmith: FlagsmithSettings {
                mode: FlagsmithMode::Offline,
                environment_id: None,
                api_url: Self::DEFAULT_FLAGSMITH_API_URL.to_owned(),
                realtime: false,
                realtime_url: Self::DEFAULT_FLAGSMITH_REALTIME_URL.to_owned(),
            },
            backend_url: Self::DEFAULT_BACKEND_URL.to_owned(),
            state_file: PathBuf::from(Self::DEFAULT_STATE_FILE),
        }
    }

    /// Load settings from the process environment.
    ///
    /// Recognised variables: `FLAGD_HOST`, `FLAGD_PORT`, `FLAGD_TLS`, `FLAG_DOCUMENTS_URL`,
    /// `FLAGSMITH_MODE`, `FLAGSMITH_ENVIRONMENT_ID`, `FLAGSMITH_API_URL`, `FLAGSMITH_REALTIME`,
    /// `FLAGSMITH_REALTIME_URL`, `BACKEND_URL` and `FLAGSWITCH_STATE_FILE`. Empty values count as
    /// unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if a numeric, boolean or mode value cannot be parsed.
    pub fn from_env() -> Result<Settings> {
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut settings = Settings::new();

        if let Some(host) = get("FLAGD_HOST") {
            settings.flagd.host = host;
        }
        if let Some(port) = get("FLAGD_PORT") {
            settings.flagd.port = port
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfiguration {
                    key: "FLAGD_PORT",
                    value: port.clone(),
                })?;
        }
        if let Some(tls) = get("FLAGD_TLS") {
            settings.flagd.tls = parse_bool("FLAGD_TLS", &tls)?;
        }
        if let Some(base) = get("FLAG_DOCUMENTS_URL") {
            settings.documents_base = base;
        }
        if let Some(mode) = get("FLAGSMITH_MODE") {
            settings.flagsmith.mode = match mode.trim().to_ascii_lowercase().as_str() {
                "offline" => FlagsmithMode::Offline,
                "online" => FlagsmithMode::Online,
                _ => {
                    return Err(Error::InvalidConfiguration {
                        key: "FLAGSMITH_MODE",
                        value: mode,
                    })
                }
            };
        }
        settings.flagsmith.environment_id = get("FLAGSMITH_ENVIRONMENT_ID");
        if let Some(api_url) = get("FLAGSMITH_API_URL") {
            settings.flagsmith.api_url = api_url;
        }
        if let Some(realtime) = get("FLAGSMITH_REALTIME") {
            settings.flagsmith.realtime = parse_bool("FLAGSMITH_REALTIME", &realtime)?;
        }
        if let Some(realtime_url) = get("FLAGSMITH_REALTIME_URL") {
            settings.flagsmith.realtime_url = realtime_url;
        }
        if let Some(backend_url) = get("BACKEND_URL") {
            settings.backend_url = backend_url;
        }
        if let Some(state_file) = get("FLAGSWITCH_STATE_FILE") {
            settings.state_file = PathBuf::from(state_file);
        }

        Ok(settings)
    }

    /// Override the flagd host.
    pub fn flagd_host(mut self, host: impl Into<String>) -> Self {
        self.flagd.host = host.into();
        self
    }

    /// Override the flagd port.
    pub fn flagd_port(mut self, port: u16) -> Self {
        self.flagd.port = port;
        self
    }

    /// Connect to flagd over TLS.
    pub fn flagd_tls(mut self, tls: bool) -> Self {
        self.flagd.tls = tls;
        self
    }

    /// Override the base flag documents are loaded from (URL or directory).
    pub fn documents_base(mut self, base: impl Into<String>) -> Self {
        self.documents_base = base.into();
        self
    }

    /// Select offline or online Flagsmith evaluation.
    pub fn flagsmith_mode(mut self, mode: FlagsmithMode) -> Self {
        self.flagsmith.mode = mode;
        self
    }

    /// Set the Flagsmith environment key.
    pub fn flagsmith_environment_id(mut self, environment_id: impl Into<String>) -> Self {
        self.flagsmith.environment_id = Some(environment_id.into());
        self
    }

    /// Override the Flagsmith API base URL.
    pub fn flagsmith_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.flagsmith.api_url = api_url.into();
        self
    }

    /// Enable realtime Flagsmith updates.
    pub fn flagsmith_realtime(mut self, realtime: bool) -> Self {
        self.flagsmith.realtime = realtime;
        self
    }

    /// Override the Flagsmith realtime base URL.
    pub fn flagsmith_realtime_url(mut self, realtime_url: impl Into<String>) -> Self {
        self.flagsmith.realtime_url = realtime_url.into();
        self
    }

    /// Override the backend base URL.
    pub fn backend_url(mut self, backend_url: impl Into<String>) -> Self {
        self.backend_url = backend_url.into();
        self
    }

    /// Override where the provider choice is persisted.
    pub fn state_file(mut self, state_file: impl Into<PathBuf>) -> Self {
        self.state_file = state_file.into();
        self
    }

    /// flagd settings.
    pub fn flagd(&self) -> &FlagdSettings {
        &self.flagd
    }

    /// Base location of flag documents.
    pub fn documents(&self) -> &str {
        &self.documents_base
    }

    /// Flagsmith settings.
    pub fn flagsmith(&self) -> &FlagsmithSettings {
        &self.flagsmith
    }

    /// Backend base URL.
    pub fn backend(&self) -> &str {
        &self.backend_url
    }

    /// Path of the persisted provider choice.
    pub fn state_path(&self) -> &Path {
        &self.state_file
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfiguration {
            key,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{FlagsmithMode, Settings};
    use crate::Error;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::new());
        assert_eq!(settings.flagd().port, 8013);
        assert_eq!(settings.flagsmith().mode, FlagsmithMode::Offline);
    }

    #[test]
    fn reads_environment() {
        let settings = Settings::from_lookup(lookup(&[
            ("FLAGD_HOST", "flagd.internal"),
            ("FLAGD_PORT", "9013"),
            ("FLAGD_TLS", "TRUE"),
            ("FLAGSMITH_MODE", "online"),
            ("FLAGSMITH_ENVIRONMENT_ID", "env-key"),
            ("FLAGSMITH_REALTIME", "1"),
            ("BACKEND_URL", "http://api:8000"),
        ]))
        .unwrap();

        assert_eq!(settings.flagd().host, "flagd.internal");
        assert_eq!(settings.flagd().port, 9013);
        assert!(settings.flagd().tls);
        assert_eq!(settings.flagsmith().mode, FlagsmithMode::Online);
        assert_eq!(settings.flagsmith().environment_id.as_deref(), Some("env-key"));
        assert!(settings.flagsmith().realtime);
        assert_eq!(settings.backend(), "http://api:8000");
    }

    #[test]
    fn empty_values_count_as_unset() {
        let settings =
            Settings::from_lookup(lookup(&[("FLAGSMITH_ENVIRONMENT_ID", " "), ("FLAGD_PORT", "")]))
                .unwrap();
        assert_eq!(settings.flagsmith().environment_id, None);
        assert_eq!(settings.flagd().port, 8013);
    }

    #[test]
    fn rejects_malformed_port() {
        let result = Settings::from_lookup(lookup(&[("FLAGD_PORT", "eighty")]));
        assert!(matches!(
            result,
            Err(Error::InvalidConfiguration { key: "FLAGD_PORT", .. })
        ));
    }

    #[test]
    fn rejects_unknown_flagsmith_mode() {
        let result = Settings::from_lookup(lookup(&[("FLAGSMITH_MODE", "hybrid")]));
        assert!(matches!(
            result,
            Err(Error::InvalidConfiguration { key: "FLAGSMITH_MODE", .. })
        ));
    }
}
