use std::time::Duration;

use crate::config::EndpointClassConfig;

/// Segment-aware prefix match: `/api/v1/readings` matches `/api/v1/readings` and
/// `/api/v1/readings/42`, but not `/api/v1/readings_archive`.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointClass {
    pub name: String,
    pub prefixes: Vec<String>,
    pub limit: u64,
    pub window: Duration,
}

impl From<&EndpointClassConfig> for EndpointClass {
    fn from(config: &EndpointClassConfig) -> Self {
        Self {
            name: config.name.clone(),
            prefixes: config.prefixes.clone(),
            limit: config.limit,
            window: Duration::from_secs(config.window_seconds),
        }
    }
}

/// Maps request paths to one layer's endpoint classes
#[derive(Clone, Debug)]
pub struct EndpointClassifier {
    classes: Vec<EndpointClass>,
    default_class: Option<usize>,
}

impl EndpointClassifier {
    pub fn new(classes: &[EndpointClassConfig], default_class: Option<&str>) -> Self {
        let classes: Vec<EndpointClass> = classes.iter().map(EndpointClass::from).collect();
        let default_class = default_class.and_then(|name| classes.iter().position(|c| c.name == name));
        Self {
            classes,
            default_class,
        }
    }

    /// The class whose longest prefix matches `path`. Ties go to the class listed first.
    /// Paths that match nothing get the default class, if there is one.
    pub fn classify(&self, path: &str) -> Option<&EndpointClass> {
        let mut best: Option<(usize, &EndpointClass)> = None;
        for class in &self.classes {
            for prefix in &class.prefixes {
                if !prefix_matches(prefix, path) {
                    continue;
                }
                let len = prefix.trim_end_matches('/').len();
                if best.is_none_or(|(best_len, _)| len > best_len) {
                    best = Some((len, class));
                }
            }
        }
        best.map(|(_, class)| class)
            .or_else(|| self.default_class.and_then(|i| self.classes.get(i)))
    }
}
