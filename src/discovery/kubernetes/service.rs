use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::enqueue_events;
use super::queue::WorkQueue;
use crate::tags::TagSet;
use crate::target::{Fingerprinter, Target, TargetGroup};

/// Watches services in one namespace (or cluster wide) and reports one
/// target per service port.
pub(super) struct ServiceDiscoverer {
    services: Api<Service>,
    watch: watcher::Config,
    synced: Arc<AtomicBool>,
}

impl ServiceDiscoverer {
    pub(super) fn new(
        client: &Client,
        namespace: Option<&str>,
        watch: watcher::Config,
        synced: Arc<AtomicBool>,
    ) -> Self {
        let services = match namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        };

        Self {
            services,
            watch,
            synced,
        }
    }

    pub(super) async fn run(self, out: mpsc::Sender<TargetGroup>, shutdown: CancellationToken) {
        let writer = reflector::store::Writer::<Service>::default();
        let services = writer.as_reader();

        let queue = Arc::new(WorkQueue::default());

        let mut tasks = JoinSet::new();
        tasks.spawn(enqueue_events(
            reflector::reflector(writer, watcher::watcher(self.services, self.watch.clone())),
            Arc::clone(&queue),
            Arc::clone(&self.synced),
            shutdown.clone(),
        ));

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

            let source = format!("k8s/service/{namespace}/{name}");
            let group = match services.get(&ObjectRef::new(name).within(namespace)) {
                None => TargetGroup::new(source),
                Some(service) => build_group(source, &service),
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

/// One monitorable port of a service, addressed through cluster DNS.
#[derive(Debug)]
pub(super) struct ServiceTarget {
    hash: u64,
    tuid: String,
    tags: TagSet,

    address: String,
    namespace: String,
    name: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    cluster_ip: String,
    external_name: String,
    kind: String,
    port: String,
    port_name: String,
    port_protocol: String,
}

impl ServiceTarget {
    fn fingerprint(&self) -> u64 {
        Fingerprinter::new()
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .map("labels", &self.labels)
            .map("annotations", &self.annotations)
            .field("cluster_ip", &self.cluster_ip)
            .field("external_name", &self.external_name)
            .field("type", &self.kind)
            .field("port", &self.port)
            .field("port_name", &self.port_name)
            .field("port_protocol", &self.port_protocol)
            .finish()
    }
}

impl Target for ServiceTarget {
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

        match name {
            "tuid" => Some(self.tuid.clone()),
            "address" => Some(self.address.clone()),
            "namespace" => Some(self.namespace.clone()),
            "name" => Some(self.name.clone()),
            "cluster_ip" => Some(self.cluster_ip.clone()),
            "external_name" => Some(self.external_name.clone()),
            "type" => Some(self.kind.clone()),
            "port" => Some(self.port.clone()),
            "port_name" => Some(self.port_name.clone()),
            "port_protocol" => Some(self.port_protocol.clone()),
            _ => None,
        }
    }
}

/// Builds the target group for one service: one target per declared port,
/// addressed as `name.namespace.svc:port`. A service without a cluster IP
/// or without ports yields an empty group.
fn build_group(source: String, service: &Service) -> TargetGroup {
    let mut group = TargetGroup::new(source);

    let Some(spec) = &service.spec else {
        return group;
    };
    let Some(cluster_ip) = spec.cluster_ip.as_deref().filter(|ip| !ip.is_empty()) else {
        return group;
    };
    let ports = spec.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        return group;
    }

    let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let labels = service.metadata.labels.clone().unwrap_or_default();
    let annotations = service.metadata.annotations.clone().unwrap_or_default();
    let external_name = spec.external_name.clone().unwrap_or_default();
    let kind = spec.type_.clone().unwrap_or_default();

    for port in ports {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");

        let mut target = ServiceTarget {
            hash: 0,
            tuid: String::new(),
            tags: TagSet::default(),
            address: format!("{name}.{namespace}.svc:{}", port.port),
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: labels.clone(),
            annotations: annotations.clone(),
            cluster_ip: cluster_ip.to_string(),
            external_name: external_name.clone(),
            kind: kind.clone(),
            port: port.port.to_string(),
            port_name: port.name.clone().unwrap_or_default(),
            port_protocol: protocol.to_string(),
        };

        target.tuid = format!(
            "{}_{}_{}_{}",
            target.namespace,
            target.name,
            target.port_protocol.to_lowercase(),
            target.port,
        );
        target.hash = target.fingerprint();

        group.targets.push(Box::new(target));
    }

    group
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    use super::*;

    fn service(cluster_ip: Option<&str>, ports: &[(i32, &str)]) -> Service {
        let mut service = Service::default();
        service.metadata.name = Some("web".to_string());
        service.metadata.namespace = Some("default".to_string());
        service.metadata.labels = Some([("app".to_string(), "nginx".to_string())].into());
        service.spec = Some(ServiceSpec {
            cluster_ip: cluster_ip.map(str::to_string),
            type_: Some("ClusterIP".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(number, name)| ServicePort {
                        port: *number,
                        name: (!name.is_empty()).then(|| name.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        service
    }

    fn build(service: &Service) -> TargetGroup {
        build_group("k8s/service/default/web".to_string(), service)
    }

    #[test]
    fn one_target_per_service_port() {
        let service = service(Some("10.96.0.10"), &[(80, "http"), (443, "https")]);

        let group = build(&service);
        assert_eq!(group.source, "k8s/service/default/web");
        assert_eq!(group.targets.len(), 2);

        let first = &group.targets[0];
        assert_eq!(first.tuid(), "default_web_tcp_80");
        assert_eq!(first.field("address").as_deref(), Some("web.default.svc:80"));
        assert_eq!(first.field("cluster_ip").as_deref(), Some("10.96.0.10"));
        assert_eq!(first.field("type").as_deref(), Some("ClusterIP"));
        assert_eq!(first.field("labels.app").as_deref(), Some("nginx"));
        assert_eq!(first.field("nosuch"), None);
    }

    #[test]
    fn service_without_cluster_ip_yields_empty_group() {
        let service = service(None, &[(80, "http")]);
        assert!(build(&service).targets.is_empty());

        let service = self::service(Some(""), &[(80, "http")]);
        assert!(build(&service).targets.is_empty());
    }

    #[test]
    fn service_without_ports_yields_empty_group() {
        let service = service(Some("10.96.0.10"), &[]);
        assert!(build(&service).targets.is_empty());
    }

    #[test]
    fn identical_services_hash_identically() {
        let service = service(Some("10.96.0.10"), &[(80, "http")]);

        let first = build(&service);
        let second = build(&service);
        assert_eq!(first.targets[0].hash(), second.targets[0].hash());

        let changed = self::service(Some("10.96.0.11"), &[(80, "http")]);
        let third = build(&changed);
        assert_ne!(first.targets[0].hash(), third.targets[0].hash());
    }
}
