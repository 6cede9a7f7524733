//! Parameters accepted by list and watch calls.
use crate::metadata::ObjectMeta;
use std::collections::BTreeMap;

/// Common query parameters for list and watch calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Only equality based selectors are supported: `key=value` pairs separated by `,`,
    /// all of which must match. Defaults to everything if `None`.
    pub label_selector: Option<String>,
    /// Restrict results to a single namespace. Defaults to all namespaces if `None`.
    pub namespace: Option<String>,
}

impl ListParams {
    /// Configure the selector to restrict the list of returned objects by their labels.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Restrict results to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Whether an object with this metadata would be returned by a query with these parameters
    #[must_use]
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if meta.namespace.as_ref() != Some(ns) {
                return false;
            }
        }
        match &self.label_selector {
            Some(selector) => selector_matches(selector, &meta.labels),
            None => true,
        }
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once("!=") {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) != Some(value.trim()),
            None => match term.split_once('=') {
                Some((key, value)) => {
                    let value = value.trim_start_matches('=').trim();
                    labels.get(key.trim()).map(String::as_str) == Some(value)
                }
                // bare key: existence
                None => labels.contains_key(term),
            },
        })
}
