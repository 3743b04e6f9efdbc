use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::Discoverer;
use crate::tags::TagSet;
use crate::target::{Fingerprinter, Target, TargetGroup};

/// A target with canned fields, for exercising engines and the pipeline
/// without a live discoverer.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockTarget {
    hash: u64,
    tuid: String,
    tags: TagSet,
    fields: BTreeMap<String, String>,
}

impl MockTarget {
    pub(crate) fn new(tuid: &str, fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>();

        let hash = Fingerprinter::new()
            .field("tuid", tuid)
            .map("fields", &fields)
            .finish();

        Self {
            hash,
            tuid: tuid.to_string(),
            tags: TagSet::default(),
            fields,
        }
    }

    pub(crate) fn with_tags(mut self, tags: &str) -> Self {
        self.tags = TagSet::parse(tags).unwrap();
        self
    }
}

impl Target for MockTarget {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn tuid(&self) -> &str {
        &self.tuid
    }

    fn tags(&self) -> &TagSet {
        &self.tags
    }

    fn tags_mut(&mut self) -> &mut TagSet {
        &mut self.tags
    }

    fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }
}

pub(crate) fn group(source: &str, targets: Vec<MockTarget>) -> TargetGroup {
    TargetGroup {
        source: source.to_string(),
        targets: targets
            .into_iter()
            .map(|target| Box::new(target) as Box<dyn Target>)
            .collect(),
    }
}

/// Emits canned batches on a fixed schedule, then idles until cancelled
/// like a real watcher would. The first batch goes out after one second,
/// later batches ten seconds apart, so a paused-clock test with a five
/// second debounce sees each batch in its own emission.
pub(crate) struct StaticDiscoverer {
    batches: Vec<Vec<TargetGroup>>,
}

impl StaticDiscoverer {
    pub(crate) fn new(batches: Vec<Vec<TargetGroup>>) -> Self {
        Self { batches }
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn discover(
        self: Box<Self>,
        out: mpsc::Sender<Vec<TargetGroup>>,
        shutdown: CancellationToken,
    ) {
        for (index, batch) in self.batches.into_iter().enumerate() {
            let delay = if index == 0 {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(10)
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if out.send(batch).await.is_err() {
                return;
            }
        }

        shutdown.cancelled().await;
    }
}
