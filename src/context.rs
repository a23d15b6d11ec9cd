use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute name under which the user identifier is exposed to targeting rules.
pub const USER_ID_ATTRIBUTE: &str = "userId";

/// Evaluation context pushed to the active provider.
///
/// The user identifier doubles as the targeting identity. Additional attributes are optional and
/// are forwarded to providers that evaluate attribute conditions locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    user_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    attributes: Map<String, Value>,
}

impl EvaluationContext {
    /// User identifier used before anyone identifies.
    pub const ANONYMOUS: &'static str = "anonymous";

    /// Create a context for `user_id`. An empty id is treated as [`EvaluationContext::ANONYMOUS`].
    ///
    /// ```
    /// # use flagswitch::EvaluationContext;
    /// let context = EvaluationContext::new("alice");
    /// assert_eq!(context.user_id(), "alice");
    /// assert_eq!(EvaluationContext::new("").user_id(), "anonymous");
    /// ```
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let user_id = if user_id.trim().is_empty() {
            Self::ANONYMOUS.to_owned()
        } else {
            user_id
        };
        EvaluationContext {
            user_id,
            attributes: Map::new(),
        }
    }

    /// Add an extra attribute. `userId` cannot be overridden this way.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != USER_ID_ATTRIBUTE {
            self.attributes.insert(name, value.into());
        }
        self
    }

    /// The user identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Attributes visible to targeting rules, always including `userId`.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attributes = self.attributes.clone();
        attributes.insert(
            USER_ID_ATTRIBUTE.to_owned(),
            Value::String(self.user_id.clone()),
        );
        attributes
    }
}

impl Default for EvaluationContext {
    fn default() -> Self {
        EvaluationContext::new(Self::ANONYMOUS)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::EvaluationContext;

    #[test]
    fn attributes_always_carry_user_id() {
        let context = EvaluationContext::new("alice")
            .with_attribute("plan", "pro")
            .with_attribute("userId", "mallory");

        let attributes = context.attributes();
        assert_eq!(attributes.get("userId"), Some(&json!("alice")));
        assert_eq!(attributes.get("plan"), Some(&json!("pro")));
    }

    #[test]
    fn blank_user_is_anonymous() {
        assert_eq!(EvaluationContext::new("  ").user_id(), "anonymous");
        assert_eq!(EvaluationContext::default().user_id(), "anonymous");
    }
}
