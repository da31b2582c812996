//! URI templates with `{var}` placeholders.
//!
//! Example: `https://api.github.com/repos/{repo_name}/commits?access_token={api_key}`

use std::fmt;

use indexmap::IndexMap;

use crate::error::AppError;
use crate::range_var::RangeVar;

/// Placeholder prefix reserved for API keys.
///
/// `{api_key}` and `{api_key_0}` refer to the first configured key,
/// `{api_key_N}` to the key at index `N`.
pub const API_KEY_PREFIX: &str = "api_key";

/// A URI pattern. Two templates are equal when their patterns are identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    pattern: String,
}

impl UriTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of all placeholders, deduplicated, in order of first occurrence.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for token in Tokens::new(&self.pattern) {
            if let Token::Var(name) = token
                && !names.iter().any(|n| n == name)
            {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Replace every `{name|start;stop;step}` placeholder by `{name}` and
    /// return the parsed range variables.
    pub fn rewrite_range_vars(&mut self) -> Result<Vec<RangeVar>, AppError> {
        let mut range_vars: Vec<RangeVar> = Vec::new();
        let mut rewritten = String::with_capacity(self.pattern.len());

        for token in Tokens::new(&self.pattern) {
            match token {
                Token::Var(var) if var.contains('|') => {
                    let range_var: RangeVar = var.parse()?;
                    rewritten.push('{');
                    rewritten.push_str(&range_var.name);
                    rewritten.push('}');
                    if let Some(existing) = range_vars.iter().find(|r| r.name == range_var.name) {
                        if *existing != range_var {
                            return Err(AppError::config(format!(
                                "Range variable {} declared twice with different bounds",
                                range_var.name
                            )));
                        }
                    } else {
                        range_vars.push(range_var);
                    }
                }
                Token::Var(var) => {
                    rewritten.push('{');
                    rewritten.push_str(var);
                    rewritten.push('}');
                }
                Token::Literal(text) => rewritten.push_str(text),
            }
        }

        self.pattern = rewritten;
        Ok(range_vars)
    }

    /// Substitute every placeholder with its value.
    ///
    /// Substitution is a single pass, so values that themselves contain
    /// braces are never expanded again.
    pub fn expand(&self, values: &IndexMap<String, String>) -> Result<String, AppError> {
        let mut uri = String::with_capacity(self.pattern.len());
        for token in Tokens::new(&self.pattern) {
            match token {
                Token::Var(name) => {
                    let value = values.get(name).ok_or_else(|| {
                        AppError::config(format!(
                            "Value for URI variable {name} missing in template {}",
                            self.pattern
                        ))
                    })?;
                    uri.push_str(value);
                }
                Token::Literal(text) => uri.push_str(text),
            }
        }
        Ok(uri)
    }
}

/// Index of the API key an `api_key*` placeholder refers to.
pub fn api_key_slot(variable: &str) -> Option<usize> {
    let rest = variable.strip_prefix(API_KEY_PREFIX)?;
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix('_')?.parse().ok()
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

enum Token<'a> {
    Literal(&'a str),
    Var(&'a str),
}

/// Linear scanner splitting a pattern into literals and `{...}` placeholders.
///
/// An unmatched `{` or an empty `{}` is kept as literal text.
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(pattern: &'a str) -> Self {
        Self { rest: pattern }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if self.rest.is_empty() {
            return None;
        }

        if let Some(body) = self.rest.strip_prefix('{')
            && let Some(end) = body.find('}')
            && end > 0
        {
            self.rest = &body[end + 1..];
            return Some(Token::Var(&body[..end]));
        }

        // Literal up to the next '{' after the first character.
        let skip = self.rest.chars().next().map_or(0, char::len_utf8);
        let split = self.rest[skip..]
            .find('{')
            .map(|i| i + skip)
            .unwrap_or(self.rest.len());
        let (literal, rest) = self.rest.split_at(split);
        self.rest = rest;
        Some(Token::Literal(literal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn discovers_variables_in_order_without_duplicates() {
        let template = UriTemplate::new("https://x.org/{user}/{repo}/{user}?key={api_key}");
        assert_eq!(template.variables(), vec!["user", "repo", "api_key"]);
    }

    #[test]
    fn expands_every_variable() {
        let template = UriTemplate::new("https://api.github.com/repos/{repo_name}/commits/{sha}");
        let values = vars(&[("repo_name", "rust-lang/rust"), ("sha", "abc123")]);
        let uri = template.expand(&values).unwrap();
        assert_eq!(uri, "https://api.github.com/repos/rust-lang/rust/commits/abc123");
        for value in values.values() {
            assert!(uri.contains(value.as_str()));
        }
    }

    #[test]
    fn missing_value_is_a_config_error() {
        let template = UriTemplate::new("https://x.org/{user}?key={api_key}");
        let err = template.expand(&vars(&[("user", "ada")])).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let template = UriTemplate::new("https://x.org/{a}/{b}");
        let uri = template
            .expand(&vars(&[("a", "{b}"), ("b", "two")]))
            .unwrap();
        assert_eq!(uri, "https://x.org/{b}/two");
    }

    #[test]
    fn stray_braces_are_literal() {
        let template = UriTemplate::new("https://x.org/{id}/{open");
        assert_eq!(template.variables(), vec!["id"]);
        let template = UriTemplate::new("https://x.org/{}/path}");
        assert!(template.variables().is_empty());
        assert_eq!(template.expand(&IndexMap::new()).unwrap(), "https://x.org/{}/path}");
    }

    #[test]
    fn non_ascii_literals() {
        let template = UriTemplate::new("https://x.org/é/{name}/ü");
        let uri = template.expand(&vars(&[("name", "ß")])).unwrap();
        assert_eq!(uri, "https://x.org/é/ß/ü");
    }

    #[test]
    fn rewrites_range_variables() {
        let mut template =
            UriTemplate::new("https://search.example.com/?q={query}&start={start|1;91;10}");
        let range_vars = template.rewrite_range_vars().unwrap();
        assert_eq!(template.pattern(), "https://search.example.com/?q={query}&start={start}");
        assert_eq!(range_vars.len(), 1);
        assert_eq!(range_vars[0].name, "start");
        assert_eq!(template.variables(), vec!["query", "start"]);
    }

    #[test]
    fn malformed_range_variable_fails() {
        let mut template = UriTemplate::new("https://x.org/?start={start|1;91}");
        assert!(template.rewrite_range_vars().is_err());
    }

    #[test]
    fn equality_is_pattern_equality() {
        assert_eq!(UriTemplate::new("https://x.org/{a}"), UriTemplate::new("https://x.org/{a}"));
        assert_ne!(UriTemplate::new("https://x.org/{a}"), UriTemplate::new("https://x.org/{b}"));
    }

    #[test]
    fn api_key_slots() {
        assert_eq!(api_key_slot("api_key"), Some(0));
        assert_eq!(api_key_slot("api_key_0"), Some(0));
        assert_eq!(api_key_slot("api_key_2"), Some(2));
        assert_eq!(api_key_slot("api_keys"), None);
        assert_eq!(api_key_slot("user"), None);
    }
}
