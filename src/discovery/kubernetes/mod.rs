mod pod;
mod queue;
mod service;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use self::queue::WorkQueue;
use super::Discoverer;
use crate::tags::{self, TagSet};
use crate::target::TargetGroup;

const NODE_NAME_ENV: &str = "MY_NODE_NAME";

#[derive(Debug, Error)]
pub enum Error {
    #[error("tags: {0}")]
    Tags(tags::ParseError),

    #[error("local mode requires the {NODE_NAME_ENV} environment variable")]
    NodeNameUnset,

    #[error("create kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// The Kubernetes role of entities that should be discovered.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pod,
    Service,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub role: Role,

    /// Tags merged into every target this discoverer reports, e.g.
    /// `"k8s pod"`. Must not be empty.
    pub tags: String,

    /// Optional namespace discovery. If not provided, all namespaces are
    /// used.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Optional label and field selectors to limit the discovery process
    /// to a subset of available resources.
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub field_selector: Option<String>,

    /// Pod role only: watch only pods scheduled on the node this agent
    /// runs on, named by the `MY_NODE_NAME` environment variable.
    #[serde(default)]
    pub local_mode: bool,
}

impl Config {
    /// Validates the configuration and connects the Kubernetes client.
    /// Every failure surfaces here, before any watch starts.
    pub async fn build(&self) -> Result<TargetDiscovery, Error> {
        let tags = TagSet::parse(&self.tags).map_err(Error::Tags)?;

        let mut field_selector = self.field_selector.clone();
        if self.local_mode && self.role == Role::Pod {
            let node = std::env::var(NODE_NAME_ENV).map_err(|_| Error::NodeNameUnset)?;
            let clause = format!("spec.nodeName={node}");
            field_selector = Some(match field_selector {
                Some(existing) => format!("{existing},{clause}"),
                None => clause,
            });
        }

        let client = Client::try_default().await?;

        let mut watch = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            watch = watch.labels(selector);
        }
        if let Some(selector) = &field_selector {
            watch = watch.fields(selector);
        }

        let namespaces = if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().cloned().map(Some).collect()
        };

        let mut readiness = Readiness::default();
        let mut discoverers = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            let namespace = namespace.as_deref();
            discoverers.push(match self.role {
                Role::Pod => RoleDiscoverer::Pod(pod::PodDiscoverer::new(
                    &client,
                    namespace,
                    watch.clone(),
                    readiness.handle(),
                )),
                Role::Service => RoleDiscoverer::Service(service::ServiceDiscoverer::new(
                    &client,
                    namespace,
                    watch.clone(),
                    readiness.handle(),
                )),
            });
        }

        Ok(TargetDiscovery {
            tags,
            discoverers,
            readiness,
        })
    }
}

/// Tracks whether every underlying watch has completed its initial sync,
/// for callers that need a consistent initial snapshot before proceeding.
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    watches: Vec<Arc<AtomicBool>>,
}

impl Readiness {
    fn handle(&mut self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.watches.push(Arc::clone(&flag));
        flag
    }

    pub fn ready(&self) -> bool {
        !self.watches.is_empty() && self.watches.iter().all(|watch| watch.load(Ordering::Acquire))
    }
}

enum RoleDiscoverer {
    Pod(pod::PodDiscoverer),
    Service(service::ServiceDiscoverer),
}

/// Kubernetes target discovery: one watcher per configured namespace and
/// role, fanned in and forwarded immediately. Debouncing is the discovery
/// manager's job, not this discoverer's.
pub struct TargetDiscovery {
    tags: TagSet,
    discoverers: Vec<RoleDiscoverer>,
    readiness: Readiness,
}

impl TargetDiscovery {
    /// A handle answering whether all watches have seen their initial
    /// sync. Usable while the discovery runs.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }
}

#[async_trait]
impl Discoverer for TargetDiscovery {
    async fn discover(
        self: Box<Self>,
        out: mpsc::Sender<Vec<TargetGroup>>,
        shutdown: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::channel::<TargetGroup>(16);

        let mut tasks = JoinSet::new();
        for discoverer in self.discoverers {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            match discoverer {
                RoleDiscoverer::Pod(pod) => {
                    tasks.spawn(pod.run(tx, shutdown));
                }
                RoleDiscoverer::Service(service) => {
                    tasks.spawn(service.run(tx, shutdown));
                }
            }
        }
        drop(tx);

        loop {
            let mut group = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(group) => group,
                    None => break,
                },
            };

            for target in group.targets.iter_mut() {
                target.tags_mut().merge(&self.tags);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = out.send(vec![group]) => if result.is_err() {
                    break;
                },
            }
        }

        tasks.shutdown().await;
    }
}

/// Pumps a reflector stream so its store stays current. Watch errors are
/// logged; retry/backoff lives inside the watcher itself.
async fn drive<K, S>(stream: S, shutdown: CancellationToken)
where
    K: Resource,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(message = "watch stream error", ?err);
                }
                None => break,
            },
        }
    }
}

/// Feeds watcher events into the reconcile queue as `namespace/name` keys.
///
/// On `InitDone` the watch is marked synced, and keys that were known
/// before a re-list but absent from it are re-enqueued: their store state
/// is gone, so the worker will emit the empty group that retracts them.
async fn enqueue_events<K, S>(
    stream: S,
    queue: Arc<WorkQueue>,
    synced: Arc<AtomicBool>,
    shutdown: CancellationToken,
) where
    K: Resource,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    tokio::pin!(stream);

    let mut known: HashSet<String> = HashSet::new();
    let mut relisted: Option<HashSet<String>> = None;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(message = "watch stream error", ?err);
                    continue;
                }
                None => break,
            },
        };

        match event {
            watcher::Event::Apply(object) => {
                if let Some(key) = object_key(&object) {
                    known.insert(key.clone());
                    queue.add(key);
                }
            }
            watcher::Event::Delete(object) => {
                if let Some(key) = object_key(&object) {
                    known.remove(&key);
                    queue.add(key);
                }
            }
            watcher::Event::Init => {
                relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(object) => {
                if let Some(key) = object_key(&object) {
                    if let Some(seen) = relisted.as_mut() {
                        seen.insert(key.clone());
                    }
                    queue.add(key);
                }
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relisted.take() {
                    for key in known.difference(&seen) {
                        queue.add(key.clone());
                    }
                    known = seen;
                }

                synced.store(true, Ordering::Release);
            }
        }
    }

    // the watch is gone; let the worker drain and stop
    queue.shutdown();
}

fn object_key<K: Resource>(object: &K) -> Option<String> {
    let name = object.meta().name.as_deref()?;
    let namespace = object.meta().namespace.as_deref().unwrap_or_default();
    Some(format!("{namespace}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_deserializes_lowercase_only() {
        assert_eq!(serde_yaml::from_str::<Role>("pod").unwrap(), Role::Pod);
        assert_eq!(
            serde_yaml::from_str::<Role>("service").unwrap(),
            Role::Service
        );
        assert!(serde_yaml::from_str::<Role>("node").is_err());
        assert!(serde_yaml::from_str::<Role>("Pod").is_err());
    }

    #[test]
    fn config_requires_role_and_tags() {
        let config = serde_yaml::from_str::<Config>(
            r#"
role: pod
tags: "k8s pod"
namespaces: [default, kube-system]
"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Pod);
        assert_eq!(config.namespaces.len(), 2);
        assert!(!config.local_mode);

        assert!(serde_yaml::from_str::<Config>("role: pod").is_err());
        assert!(serde_yaml::from_str::<Config>("tags: k8s").is_err());
    }

    #[test]
    fn readiness_requires_every_watch() {
        let mut readiness = Readiness::default();
        assert!(!readiness.ready());

        let first = readiness.handle();
        let second = readiness.handle();
        assert!(!readiness.ready());

        first.store(true, Ordering::Release);
        assert!(!readiness.ready());

        second.store(true, Ordering::Release);
        assert!(readiness.ready());
    }

    #[test]
    fn object_keys() {
        use k8s_openapi::api::core::v1::Pod;

        let mut pod = Pod::default();
        assert_eq!(object_key(&pod), None);

        pod.metadata.name = Some("web".to_string());
        pod.metadata.namespace = Some("default".to_string());
        assert_eq!(object_key(&pod).as_deref(), Some("default/web"));
    }
}
