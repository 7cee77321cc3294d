//! `{{ name }}` placeholder rendering for stage fields.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_-]+)?)\s*\}\}")
        .expect("valid placeholder regex")
});

/// Placeholder names referenced by `input`, in order of appearance.
pub fn placeholders(input: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(input)
        .map(|cap| cap[1].to_string())
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown placeholder '{{{{ {0} }}}}'")]
pub struct UnknownPlaceholder(pub String);

/// Variable bindings for rendering.
#[derive(Debug, Clone, Default)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// A copy of `self` with one extra binding.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.insert(key, value);
        next
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Replace every placeholder in `input`.
    ///
    /// # Errors
    ///
    /// Returns the first placeholder that has no binding.
    pub fn render(&self, input: &str) -> Result<String, UnknownPlaceholder> {
        let mut missing = None;
        let rendered = PLACEHOLDER_RE.replace_all(input, |cap: &Captures<'_>| {
            if let Some(value) = self.0.get(&cap[1]) {
                value.clone()
            } else {
                if missing.is_none() {
                    missing = Some(cap[1].to_string());
                }
                String::new()
            }
        });
        match missing {
            Some(name) => Err(UnknownPlaceholder(name)),
            None => Ok(rendered.into_owned()),
        }
    }
}
