//! Pre- and post-request callbacks.
//!
//! Configurations refer to callbacks by name. Names are resolved against a
//! [`CallbackRegistry`] when the configuration is loaded, so an unknown name
//! fails before any request is made. Every callback has the same statically
//! checked signature: it receives one [`CallbackContext`] and may return
//! `Some(false)` to reject the entity (only honoured when the matching
//! filter flag is enabled in the configuration).

use std::collections::HashMap;
use std::fmt;

use crate::entity::Entity;
use crate::error::AppError;
use crate::value::OutputValue;

/// The single argument handed to every callback.
pub struct CallbackContext<'a> {
    /// The entity being processed. Inputs and outputs may be mutated freely.
    pub entity: &'a mut Entity,
    /// The entity processed immediately before this one, if any.
    pub predecessor: Option<&'a Entity>,
}

/// Callback signature. `None` means "no verdict".
pub type Callback = fn(&mut CallbackContext<'_>) -> Option<bool>;

/// A callback resolved from the registry, remembered together with its name.
#[derive(Clone, Copy)]
pub struct NamedCallback {
    name: &'static str,
    function: Callback,
}

impl NamedCallback {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, ctx: &mut CallbackContext<'_>) -> Option<bool> {
        (self.function)(ctx)
    }
}

impl PartialEq for NamedCallback {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for NamedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamedCallback").field(&self.name).finish()
    }
}

/// Name → callback lookup table.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<&'static str, Callback>,
}

impl CallbackRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry containing the built-in callbacks.
    pub fn with_builtins() -> Self {
        Self::new()
            .register("check_if_next_page_exists", check_if_next_page_exists)
            .register("extract_email_from_commits", extract_email_from_commits)
    }

    /// Add (or replace) a callback under `name`.
    pub fn register(mut self, name: &'static str, callback: Callback) -> Self {
        self.callbacks.insert(name, callback);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    /// Look up a callback by name.
    pub fn resolve(&self, name: &str) -> Result<NamedCallback, AppError> {
        self.callbacks
            .get_key_value(name)
            .map(|(key, function)| NamedCallback {
                name: *key,
                function: *function,
            })
            .ok_or_else(|| AppError::config(format!("Callback {name} not found")))
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.callbacks.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in callbacks
// ---------------------------------------------------------------------------

/// Pre-request continuation check for paginated searches.
///
/// Continues when there is no predecessor, when this entity starts a new
/// range-expansion family, or when the predecessor's response advertises a
/// next page (`queries.nextPage`).
pub fn check_if_next_page_exists(ctx: &mut CallbackContext<'_>) -> Option<bool> {
    let Some(predecessor) = ctx.predecessor else {
        return Some(true);
    };
    if ctx.entity.root_entity().is_none() {
        return Some(true);
    }
    if ctx.entity.root_entity() != predecessor.root_entity() {
        return Some(true);
    }

    let next_page_exists = predecessor
        .response()
        .and_then(|response| response.pointer("/queries/nextPage"))
        .is_some();
    if !next_page_exists {
        tracing::info!(entity = %ctx.entity, "Last result page reached");
    }
    Some(next_page_exists)
}

/// Post-request filter: keep the first author email containing `@` from the
/// `commits` output, then drop `commits`.
pub fn extract_email_from_commits(ctx: &mut CallbackContext<'_>) -> Option<bool> {
    let outputs = &mut ctx.entity.output_parameters;
    let commits = outputs.shift_remove("commits");

    let email = commits
        .as_ref()
        .and_then(OutputValue::as_list)
        .into_iter()
        .flatten()
        .filter_map(OutputValue::as_record)
        .filter_map(|commit| commit.get("author_email").and_then(OutputValue::as_str))
        .find(|email| email.contains('@'))
        .map(str::to_string);

    match email {
        Some(email) => {
            outputs.insert("author_email".to_string(), OutputValue::String(email));
            Some(true)
        }
        None => Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entity_with, test_config};
    use serde_json::json;

    fn always_false(_ctx: &mut CallbackContext<'_>) -> Option<bool> {
        Some(false)
    }

    #[test]
    fn resolves_registered_callbacks() {
        let registry = CallbackRegistry::new().register("always_false", always_false);
        let callback = registry.resolve("always_false").unwrap();
        assert_eq!(callback.name(), "always_false");
        assert!(registry.contains("always_false"));
    }

    #[test]
    fn unknown_callback_is_a_config_error() {
        let err = CallbackRegistry::with_builtins()
            .resolve("normalize_java")
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("normalize_java"));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = CallbackRegistry::with_builtins();
        assert!(registry.contains("check_if_next_page_exists"));
        assert!(registry.contains("extract_email_from_commits"));
    }

    #[test]
    fn extract_email_keeps_first_valid_address() {
        let config = test_config(json!({
            "name": "commit_email",
            "input_parameters": ["repo"],
            "uri_template": "https://api.example.com/{repo}/commits",
            "output_parameter_mapping": {"commits": ["*", {"author_email": ["email"]}]}
        }));
        let mut entity = entity_with(&config, &[("repo", "a/b")]);
        entity.output_parameters.insert(
            "commits".into(),
            OutputValue::from(json!([
                {"author_email": "noreply"},
                {"author_email": "ada@example.com"},
                {"author_email": "bob@example.com"}
            ])),
        );

        let mut ctx = CallbackContext {
            entity: &mut entity,
            predecessor: None,
        };
        assert_eq!(extract_email_from_commits(&mut ctx), Some(true));
        assert!(!entity.output_parameters.contains_key("commits"));
        assert_eq!(
            entity.output_parameters["author_email"],
            OutputValue::from("ada@example.com")
        );
    }

    #[test]
    fn extract_email_rejects_without_address() {
        let config = test_config(json!({
            "name": "commit_email",
            "input_parameters": ["repo"],
            "uri_template": "https://api.example.com/{repo}/commits",
            "output_parameter_mapping": {"commits": ["*"]}
        }));
        let mut entity = entity_with(&config, &[("repo", "a/b")]);
        let mut ctx = CallbackContext {
            entity: &mut entity,
            predecessor: None,
        };
        assert_eq!(extract_email_from_commits(&mut ctx), Some(false));
    }

    #[test]
    fn next_page_check_without_predecessor_continues() {
        let config = test_config(json!({
            "name": "search",
            "input_parameters": ["query"],
            "uri_template": "https://search.example.com/?q={query}",
            "output_parameter_mapping": {}
        }));
        let mut entity = entity_with(&config, &[("query", "rust")]);
        let mut ctx = CallbackContext {
            entity: &mut entity,
            predecessor: None,
        };
        assert_eq!(check_if_next_page_exists(&mut ctx), Some(true));
    }
}
