use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, Secret};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::queue::WorkQueue;
use super::{drive, enqueue_events};
use crate::tags::TagSet;
use crate::target::{Fingerprinter, Target, TargetGroup};

/// Watches pods in one namespace (or cluster wide) and reports one target
/// per container port, with container environment variables resolved
/// against the namespace's ConfigMaps and Secrets.
pub(super) struct PodDiscoverer {
    pods: Api<Pod>,
    configmaps: Api<ConfigMap>,
    secrets: Api<Secret>,
    watch: watcher::Config,
    synced: Arc<AtomicBool>,
}

impl PodDiscoverer {
    pub(super) fn new(
        client: &Client,
        namespace: Option<&str>,
        watch: watcher::Config,
        synced: Arc<AtomicBool>,
    ) -> Self {
        let (pods, configmaps, secrets) = match namespace {
            Some(namespace) => (
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client.clone(), namespace),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client.clone()),
            ),
        };

        Self {
            pods,
            configmaps,
            secrets,
            watch,
            synced,
        }
    }

    pub(super) async fn run(self, out: mpsc::Sender<TargetGroup>, shutdown: CancellationToken) {
        let pod_writer = reflector::store::Writer::<Pod>::default();
        let pods = pod_writer.as_reader();
        let cm_writer = reflector::store::Writer::<ConfigMap>::default();
        let configmaps = cm_writer.as_reader();
        let secret_writer = reflector::store::Writer::<Secret>::default();
        let secrets = secret_writer.as_reader();

        let queue = Arc::new(WorkQueue::default());

        let mut tasks = JoinSet::new();
        tasks.spawn(drive(
            reflector::reflector(
                cm_writer,
                watcher::watcher(self.configmaps, watcher::Config::default()),
            ),
            shutdown.clone(),
        ));
        tasks.spawn(drive(
            reflector::reflector(
                secret_writer,
                watcher::watcher(self.secrets, watcher::Config::default()),
            ),
            shutdown.clone(),
        ));
        tasks.spawn(enqueue_events(
            reflector::reflector(pod_writer, watcher::watcher(self.pods, self.watch.clone())),
            Arc::clone(&queue),
            Arc::clone(&self.synced),
            shutdown.clone(),
        ));

        // env resolution reads these stores; wait for their initial sync so
        // early pods do not resolve against a half filled cache
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = async {
                let _ = configmaps.wait_until_ready().await;
                let _ = secrets.wait_until_ready().await;
            } => {}
        }

        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => break,
                key = queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let Some((namespace, name)) = key.split_once('/') else {
                warn!(message = "unparsable reconcile key", key = %key);
                continue;
            };

            let source = format!("k8s/pod/{namespace}/{name}");
            let group = match pods.get(&ObjectRef::new(name).within(namespace)) {
                // absent: deleted or never existed
                None => TargetGroup::new(source),
                Some(pod) => build_group(source, &pod, &configmaps, &secrets),
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = out.send(group) => if result.is_err() {
                    break;
                },
            }
        }

        queue.shutdown();
        tasks.shutdown().await;
    }
}

/// One monitorable container port of a pod.
#[derive(Debug)]
pub(super) struct PodTarget {
    hash: u64,
    tuid: String,
    tags: TagSet,

    address: String,
    namespace: String,
    name: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    node_name: String,
    pod_ip: String,
    controller_kind: String,
    controller_name: String,
    container_name: String,
    image: String,
    env: BTreeMap<String, String>,
    port: String,
    port_name: String,
    port_protocol: String,
}

impl PodTarget {
    fn fingerprint(&self) -> u64 {
        Fingerprinter::new()
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .map("labels", &self.labels)
            .map("annotations", &self.annotations)
            .field("node_name", &self.node_name)
            .field("pod_ip", &self.pod_ip)
            .field("controller_kind", &self.controller_kind)
            .field("controller_name", &self.controller_name)
            .field("container_name", &self.container_name)
            .field("image", &self.image)
            .map("env", &self.env)
            .field("port", &self.port)
            .field("port_name", &self.port_name)
            .field("port_protocol", &self.port_protocol)
            .finish()
    }
}

impl Target for PodTarget {
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
        if let Some(key) = name.strip_prefix("labels.") {
            return self.labels.get(key).cloned();
        }
        if let Some(key) = name.strip_prefix("annotations.") {
            return self.annotations.get(key).cloned();
        }
        if let Some(key) = name.strip_prefix("env.") {
            return self.env.get(key).cloned();
        }

        match name {
            "tuid" => Some(self.tuid.clone()),
            "address" => Some(self.address.clone()),
            "namespace" => Some(self.namespace.clone()),
            "name" => Some(self.name.clone()),
            "node_name" => Some(self.node_name.clone()),
            "pod_ip" => Some(self.pod_ip.clone()),
            "controller_kind" => Some(self.controller_kind.clone()),
            "controller_name" => Some(self.controller_name.clone()),
            "container_name" => Some(self.container_name.clone()),
            "image" => Some(self.image.clone()),
            "port" => Some(self.port.clone()),
            "port_name" => Some(self.port_name.clone()),
            "port_protocol" => Some(self.port_protocol.clone()),
            _ => None,
        }
    }
}

/// Builds the target group for one pod: one target per container port.
///
/// A pod without an IP or without containers yields an empty group, which
/// downstream treats as "nothing to monitor here right now".
fn build_group(
    source: String,
    pod: &Pod,
    configmaps: &Store<ConfigMap>,
    secrets: &Store<Secret>,
) -> TargetGroup {
    let mut group = TargetGroup::new(source);

    let Some(spec) = &pod.spec else { return group };
    let Some(status) = &pod.status else { return group };
    let Some(pod_ip) = status.pod_ip.as_deref().filter(|ip| !ip.is_empty()) else {
        return group;
    };
    if spec.containers.is_empty() {
        return group;
    }

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let node_name = spec.node_name.clone().unwrap_or_default();
    let (controller_kind, controller_name) = controller_of(pod);

    for container in &spec.containers {
        let env = resolve_env(namespace, container, configmaps, secrets);
        let image = container.image.clone().unwrap_or_default();

        for port in container.ports.as_deref().unwrap_or_default() {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");

            let mut target = PodTarget {
                hash: 0,
                tuid: String::new(),
                tags: TagSet::default(),
                address: format!("{pod_ip}:{}", port.container_port),
                namespace: namespace.to_string(),
                name: name.to_string(),
                labels: labels.clone(),
                annotations: annotations.clone(),
                node_name: node_name.clone(),
                pod_ip: pod_ip.to_string(),
                controller_kind: controller_kind.clone(),
                controller_name: controller_name.clone(),
                container_name: container.name.clone(),
                image: image.clone(),
                env: env.clone(),
                port: port.container_port.to_string(),
                port_name: port.name.clone().unwrap_or_default(),
                port_protocol: protocol.to_string(),
            };

            target.tuid = format!(
                "{}_{}_{}_{}_{}",
                target.namespace,
                target.name,
                target.container_name,
                target.port_protocol.to_lowercase(),
                target.port,
            );
            target.hash = target.fingerprint();

            group.targets.push(Box::new(target));
        }
    }

    group
}

fn controller_of(pod: &Pod) -> (String, String) {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|reference| reference.controller.unwrap_or(false))
        .map(|reference| (reference.kind.clone(), reference.name.clone()))
        .unwrap_or_default()
}

/// Resolves a container's environment, layering sources from lowest to
/// highest precedence: `envFrom.configMapRef`, `envFrom.secretRef`, then
/// `env` entries in declaration order. A later source overwrites an
/// earlier one with the same variable name. Values containing `$` are
/// skipped rather than expanded, and a missing ConfigMap/Secret or key
/// leaves the variable absent.
fn resolve_env(
    namespace: &str,
    container: &Container,
    configmaps: &Store<ConfigMap>,
    secrets: &Store<Secret>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for source in container.env_from.as_deref().unwrap_or_default() {
        let Some(name) = source
            .config_map_ref
            .as_ref()
            .map(|reference| reference.name.as_str())
        else {
            continue;
        };

        if let Some(configmap) = configmaps.get(&ObjectRef::new(name).within(namespace)) {
            for (key, value) in configmap.data.clone().unwrap_or_default() {
                insert_env(&mut vars, key, value);
            }
        }
    }

    for source in container.env_from.as_deref().unwrap_or_default() {
        let Some(name) = source
            .secret_ref
            .as_ref()
            .map(|reference| reference.name.as_str())
        else {
            continue;
        };

        if let Some(secret) = secrets.get(&ObjectRef::new(name).within(namespace)) {
            for (key, value) in secret.data.clone().unwrap_or_default() {
                if let Ok(value) = String::from_utf8(value.0) {
                    insert_env(&mut vars, key, value);
                }
            }
        }
    }

    for var in container.env.as_deref().unwrap_or_default() {
        if var.name.is_empty() {
            continue;
        }

        if let Some(value) = &var.value {
            insert_env(&mut vars, var.name.clone(), value.clone());
            continue;
        }

        let Some(from) = &var.value_from else { continue };

        if let Some(selector) = &from.secret_key_ref {
            let name = selector.name.as_str();

            let value = secrets
                .get(&ObjectRef::new(name).within(namespace))
                .and_then(|secret| secret.data.as_ref()?.get(&selector.key).cloned())
                .and_then(|value| String::from_utf8(value.0).ok());

            if let Some(value) = value {
                insert_env(&mut vars, var.name.clone(), value);
            }
        } else if let Some(selector) = &from.config_map_key_ref {
            let name = selector.name.as_str();

            let value = configmaps
                .get(&ObjectRef::new(name).within(namespace))
                .and_then(|configmap| configmap.data.as_ref()?.get(&selector.key).cloned());

            if let Some(value) = value {
                insert_env(&mut vars, var.name.clone(), value);
            }
        }
    }

    vars
}

/// Variable references are not expanded; a `$` anywhere skips the value.
fn insert_env(vars: &mut BTreeMap<String, String>, key: String, value: String) {
    if value.contains('$') {
        return;
    }

    vars.insert(key, value);
}
