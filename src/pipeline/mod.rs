pub mod build;
pub mod tag;

pub use build::{ApplyConfig, BuildEngine, BuildRuleConfig};
pub use tag::{TagEngine, TagMatchConfig, TagRuleConfig};

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::{self, Discoverer};
use crate::tags::TagSet;
use crate::target::{Target, TargetGroup};
use crate::template::Funcs;

/// One rendered monitoring-job configuration record. The text is opaque to
/// this crate; only the tags and staleness matter to the consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conf {
    pub tags: TagSet,
    pub text: String,
    /// True means this config is no longer valid and whatever was scheduled
    /// from it should be removed.
    pub stale: bool,
}

impl Conf {
    fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// Decorates a target's tag set in place. Idempotent.
pub trait Tagger: Send {
    fn tag(&self, target: &mut dyn Target);
}

/// Renders configuration records for a target. Pure.
pub trait Builder: Send {
    fn build(&self, target: &dyn Target) -> Vec<Conf>;
}

/// Everything needed to assemble a running pipeline: the discovery section
/// plus the ordered tag and build rule lists. Invalid parts fail here,
/// before anything starts.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub discovery: discovery::Config,
    pub tag: Vec<TagRuleConfig>,
    pub build: Vec<BuildRuleConfig>,
}

impl Config {
    pub async fn build(&self) -> crate::Result<Pipeline> {
        let manager = self.discovery.build().await?;
        let tagger = TagEngine::new(self.tag.clone(), Funcs::default())?;
        let builder = BuildEngine::new(self.build.clone(), Funcs::default())?;

        Ok(Pipeline::new(
            Box::new(manager),
            Box::new(tagger),
            Box::new(builder),
        ))
    }
}

/// Folds discovered target groups into add/remove configuration deltas.
///
/// The cache maps `source -> (target hash -> configs)` and holds exactly
/// the configs currently believed live for each source. It is touched only
/// from the fold loop; every config a consumer ever receives is either
/// fresh or explicitly retracted as stale, never silently superseded.
pub struct Pipeline {
    discoverer: Option<Box<dyn Discoverer>>,
    tagger: Box<dyn Tagger>,
    builder: Box<dyn Builder>,
    cache: HashMap<String, HashMap<u64, Vec<Conf>>>,
}

impl Pipeline {
    pub fn new(
        discoverer: Box<dyn Discoverer>,
        tagger: Box<dyn Tagger>,
        builder: Box<dyn Builder>,
    ) -> Self {
        Self {
            discoverer: Some(discoverer),
            tagger,
            builder,
            cache: HashMap::new(),
        }
    }

    /// Runs until `shutdown` is cancelled, forwarding non-empty deltas to
    /// `out` as one batch per received group set.
    pub async fn run(mut self, out: mpsc::Sender<Vec<Conf>>, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(1);

        let mut handle = None;
        if let Some(discoverer) = self.discoverer.take() {
            handle = Some(tokio::spawn(discoverer.discover(tx, shutdown.clone())));
        }

        loop {
            let groups = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(groups) => groups,
                    None => break,
                },
            };

            let delta = self.process(groups);
            if delta.is_empty() {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = out.send(delta) => if result.is_err() {
                    debug!(message = "config consumer closed, stopping pipeline");
                    break;
                },
            }
        }

        drop(rx);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn process(&mut self, groups: Vec<TargetGroup>) -> Vec<Conf> {
        let mut delta = Vec::new();

        for group in groups {
            if group.targets.is_empty() {
                self.remove(group, &mut delta);
            } else {
                self.update(group, &mut delta);
            }
        }

        delta
    }

    /// An empty group retracts everything its source ever produced.
    fn remove(&mut self, group: TargetGroup, delta: &mut Vec<Conf>) {
        let Some(entry) = self.cache.remove(&group.source) else {
            return;
        };

        debug!(message = "source vanished, retracting configs", source = %group.source);

        for (_hash, confs) in entry {
            delta.extend(confs.into_iter().map(Conf::into_stale));
        }
    }

    fn update(&mut self, mut group: TargetGroup, delta: &mut Vec<Conf>) {
        let tagger = &*self.tagger;
        let builder = &*self.builder;

        let fresh = !self.cache.contains_key(&group.source);
        let entry = self.cache.entry(group.source).or_default();

        let mut seen = HashSet::with_capacity(group.targets.len());
        for target in group.targets.iter_mut() {
            let hash = target.hash();
            seen.insert(hash);

            // an unchanged target never regenerates its configs
            if entry.contains_key(&hash) {
                continue;
            }

            tagger.tag(target.as_mut());
            let confs = builder.build(target.as_ref());

            delta.extend(confs.iter().cloned());
            entry.insert(hash, confs);
        }

        // a brand-new entry has nothing previous to retract
        if fresh {
            return;
        }

        let gone = entry
            .keys()
            .filter(|hash| !seen.contains(hash))
            .copied()
            .collect::<Vec<_>>();

        for hash in gone {
            if let Some(confs) = entry.remove(&hash) {
                delta.extend(confs.into_iter().map(Conf::into_stale));
            }
        }
    }
}
