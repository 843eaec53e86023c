use std::collections::HashMap;

/// Flat string key/value configuration map.
///
/// The metaserver hands every subsystem its settings through one flat
/// namespace; a subsystem reads the keys under its own prefix and forwards
/// nested prefixes (for example `transmitter.`) to its collaborators. The
/// same map is re-applied at runtime through the writer's `SetParameters`
/// control request.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Numeric values follow the usual convention: zero is false, anything
    /// else is true. `true`/`false` literals are accepted as well.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(str::trim) {
            Some(value) => value
                .parse::<i64>()
                .map(|number| number != 0)
                .or_else(|_| value.parse::<bool>())
                .unwrap_or(default),
            None => default,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back_to_defaults() {
        let mut props = Properties::new();
        props.set("meta.log.maxBlockSize", "128");
        props.set("meta.log.rotateIntervalSec", "0.25");
        props.set("meta.log.sync", "1");
        props.set("meta.log.panicOnIoError", "false");

        assert_eq!(props.get_i64("meta.log.maxBlockSize", 256), 128);
        assert_eq!(props.get_i64("meta.log.missing", 256), 256);
        assert_eq!(props.get_f64("meta.log.rotateIntervalSec", 600.0), 0.25);
        assert!(props.get_bool("meta.log.sync", false));
        assert!(!props.get_bool("meta.log.panicOnIoError", true));
        assert!(props.get_bool("meta.log.missing", true));
    }

    #[test]
    fn malformed_values_fall_back() {
        let mut props = Properties::new();
        props.set("key", "not-a-number");
        assert_eq!(props.get_i64("key", 7), 7);
        assert!(props.get_bool("key", true));
    }
}
