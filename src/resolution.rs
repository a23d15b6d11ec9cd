use serde::{Deserialize, Serialize};

/// Why a resolver call produced its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The value came from the provider's static configuration.
    Static,
    /// The flag was missing or unusable, so the caller's default was returned.
    Default,
    /// A targeting rule, segment or identity override supplied the value.
    TargetingMatch,
    /// The value came from a percentage split.
    Split,
    /// The value came from a cache.
    Cached,
    /// The flag is disabled.
    Disabled,
    /// Unknown reason, e.g. a reason string the provider does not recognise.
    Unknown,
    /// The provider reported an error.
    Error,
}

impl Reason {
    /// Parse a reason string reported by a vendor. Unrecognised strings map to
    /// [`Reason::Unknown`].
    pub fn from_vendor(reason: &str) -> Reason {
        match reason.to_ascii_uppercase().as_str() {
            "STATIC" => Reason::Static,
            "DEFAULT" => Reason::Default,
            "TARGETING_MATCH" => Reason::TargetingMatch,
            "SPLIT" => Reason::Split,
            "CACHED" => Reason::Cached,
            "DISABLED" => Reason::Disabled,
            "ERROR" => Reason::Error,
            _ => Reason::Unknown,
        }
    }
}

/// Result of a single resolver call.
///
/// A value object: produced fresh on every evaluation and never stored by providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionDetails<T> {
    /// The resolved value.
    pub value: T,
    /// Variant name, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Why this value was produced.
    pub reason: Reason,
}

impl<T> ResolutionDetails<T> {
    /// A resolution that fell back to the caller's default value.
    pub fn default_value(value: T) -> Self {
        ResolutionDetails {
            value,
            variant: None,
            reason: Reason::Default,
        }
    }

    /// A resolution with `reason` and no variant.
    pub fn with_reason(value: T, reason: Reason) -> Self {
        ResolutionDetails {
            value,
            variant: None,
            reason,
        }
    }

    /// Set the variant name.
    pub fn variant(mut self, variant: Option<String>) -> Self {
        self.variant = variant;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::Reason;

    #[test]
    fn vendor_reasons() {
        assert_eq!(Reason::from_vendor("TARGETING_MATCH"), Reason::TargetingMatch);
        assert_eq!(Reason::from_vendor("static"), Reason::Static);
        assert_eq!(Reason::from_vendor("SOMETHING_NEW"), Reason::Unknown);
    }

    #[test]
    fn serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&Reason::TargetingMatch).unwrap(),
            "\"TARGETING_MATCH\""
        );
    }
}
