use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::tags::TagSet;

/// One discovered, monitorable endpoint.
///
/// Concrete variants exist per discovery role (pod, service, ...). A target
/// is immutable after construction except for its tag set, which
/// accumulates tag engine output; the tag set is owned exclusively by the
/// target and only shared within a single discovery cycle.
pub trait Target: Debug + Send {
    /// Stable content fingerprint over all exported fields. Two targets
    /// with identical observable attributes hash identically, which is
    /// what lets the pipeline deduplicate them.
    fn hash(&self) -> u64;

    /// Human readable unique identifier, for logs and debugging. Not
    /// required to be unique across roles.
    fn tuid(&self) -> &str;

    fn tags(&self) -> &TagSet;

    fn tags_mut(&mut self) -> &mut TagSet;

    /// Exported field lookup by name, as seen by templates. Map valued
    /// fields are reachable with dotted keys (`labels.app`, `env.PORT`).
    fn field(&self, name: &str) -> Option<String>;
}

/// All targets sharing one discovery source key, e.g. `k8s/pod/<ns>/<name>`.
///
/// Groups are produced fresh on every discovery event and carry no history.
/// A group with no targets is a meaningful signal: the source currently has
/// nothing to monitor, so anything previously derived from it must go.
#[derive(Debug, Default)]
pub struct TargetGroup {
    pub source: String,
    pub targets: Vec<Box<dyn Target>>,
}

impl TargetGroup {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            targets: Vec::new(),
        }
    }
}

/// Deterministic fingerprint over explicitly listed fields.
///
/// Each target variant feeds its exported fields in a fixed order; map
/// fields contribute in sorted key order. Keys and values are delimited so
/// adjacent fields cannot collide into the same byte stream.
pub(crate) struct Fingerprinter(XxHash64);

impl Fingerprinter {
    pub(crate) fn new() -> Self {
        Fingerprinter(XxHash64::with_seed(0))
    }

    pub(crate) fn field(mut self, key: &str, value: &str) -> Self {
        self.0.write(key.as_bytes());
        self.0.write(&[0x1f]);
        self.0.write(value.as_bytes());
        self.0.write(&[0x1e]);
        self
    }

    pub(crate) fn map(mut self, key: &str, map: &BTreeMap<String, String>) -> Self {
        for (name, value) in map {
            self.0.write(key.as_bytes());
            self.0.write(&[0x1f]);
            self.0.write(name.as_bytes());
            self.0.write(&[0x1f]);
            self.0.write(value.as_bytes());
            self.0.write(&[0x1e]);
        }

        self
    }

    pub(crate) fn finish(self) -> u64 {
        self.0.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let first = Fingerprinter::new()
            .field("namespace", "default")
            .field("name", "web")
            .finish();
        let second = Fingerprinter::new()
            .field("namespace", "default")
            .field("name", "web")
            .finish();

        assert_eq!(first, second);
    }

    #[test]
    fn fingerprint_field_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc"
        let first = Fingerprinter::new().field("k", "ab").field("k", "c").finish();
        let second = Fingerprinter::new().field("k", "a").field("k", "bc").finish();

        assert_ne!(first, second);
    }

    #[test]
    fn fingerprint_map_order_independent_of_insertion() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());

        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());

        let first = Fingerprinter::new().map("labels", &forward).finish();
        let second = Fingerprinter::new().map("labels", &reverse).finish();

        assert_eq!(first, second);
    }
}
