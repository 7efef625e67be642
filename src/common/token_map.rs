// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Overlays call-time (transient) topic tokens on top of construction-time (resident) ones.

use std::collections::HashMap;

/// A view combining a long-lived resident token map (fixed when an invoker, executor, or
/// telemetry envoy is constructed) with a transient token map supplied for a single call, e.g.
/// [`crate::rpc_command::invoker::Invoker::invoke`]'s per-request tokens.
///
/// Transient entries take precedence: a caller can override a resident token for one call
/// without mutating the envoy's long-lived configuration.
pub struct MergedTokenMap<'a> {
    resident: &'a HashMap<String, String>,
    transient: &'a HashMap<String, String>,
}

impl<'a> MergedTokenMap<'a> {
    /// Creates a view over `resident`, overlaid by `transient`.
    #[must_use]
    pub fn new(resident: &'a HashMap<String, String>, transient: &'a HashMap<String, String>) -> Self {
        Self { resident, transient }
    }

    /// Materializes the merged view into an owned map, as required by
    /// [`crate::common::topic_processor::TopicPattern::as_publish_topic`].
    #[must_use]
    pub fn to_owned_map(&self) -> HashMap<String, String> {
        let mut merged = self.resident.clone();
        merged.extend(self.transient.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_overrides_resident() {
        let resident = HashMap::from([("a".to_string(), "resident".to_string())]);
        let transient = HashMap::from([("a".to_string(), "transient".to_string())]);
        let merged = MergedTokenMap::new(&resident, &transient).to_owned_map();
        assert_eq!(merged.get("a"), Some(&"transient".to_string()));
    }

    #[test]
    fn disjoint_keys_are_both_present() {
        let resident = HashMap::from([("a".to_string(), "1".to_string())]);
        let transient = HashMap::from([("b".to_string(), "2".to_string())]);
        let merged = MergedTokenMap::new(&resident, &transient).to_owned_map();
        assert_eq!(merged.len(), 2);
    }
}
