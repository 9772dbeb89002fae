//! Herald kubehub – Deployment source, Notification record store and watcher wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use herald_core::{
    Identity, NotificationRecord, RecordStore, ResourceSource, Signal, SignalKind, SpecSnapshot, StoreError, WatchedResource,
};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const RECORD_GROUP: &str = "herald.dev";
pub const RECORD_VERSION: &str = "v1";
pub const RECORD_KIND: &str = "Notification";
pub const RECORD_PLURAL: &str = "notifications";

/// Label selector watched Deployments carry unless overridden.
pub const DEFAULT_SELECTOR: &str = "importantDeployment=some-ci-system";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Project a Deployment into the fields the classifier reads.
pub fn watched_from_deployment(d: &Deployment) -> Result<WatchedResource> {
    let name = d.metadata.name.clone().ok_or_else(|| anyhow!("deployment missing metadata.name"))?;
    let namespace = d.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let spec = serde_json::to_value(d.spec.clone().unwrap_or_default()).context("serializing deployment spec")?;
    let status = d.status.clone().unwrap_or_default();
    Ok(WatchedResource {
        identity: Identity { namespace, name },
        uid: d.metadata.uid.clone(),
        generation: d.metadata.generation.unwrap_or(0),
        // apiserver defaults spec.replicas to 1
        desired_replicas: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready_replicas: status.ready_replicas.unwrap_or(0),
        observed_generation: status.observed_generation.unwrap_or(0),
        deleting: d.metadata.deletion_timestamp.is_some(),
        spec,
    })
}

pub fn identity_of(d: &Deployment) -> Identity {
    Identity { namespace: d.namespace().unwrap_or_else(|| "default".to_string()), name: d.name_any() }
}

/// Deployments read straight from the API server.
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ResourceSource for KubeResources {
    async fn get(&self, identity: &Identity) -> Result<Option<WatchedResource>, StoreError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &identity.namespace);
        let found = api.get_opt(&identity.name).await.map_err(|e| store_err(e, identity, false))?;
        found.as_ref().map(watched_from_deployment).transpose().map_err(StoreError::Backend)
    }
}

pub fn record_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(RECORD_GROUP, RECORD_VERSION, RECORD_KIND);
    ApiResource::from_gvk_with_plural(&gvk, RECORD_PLURAL)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordSpec {
    message: String,
    deployment: SnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<String>,
    generation: i64,
    spec: Json,
}

/// Encode a record as a `Notification` object; the version travels as resourceVersion.
pub fn record_to_object(rec: &NotificationRecord) -> Result<DynamicObject> {
    let spec = RecordSpec {
        message: rec.message.clone(),
        deployment: SnapshotSpec {
            uid: rec.snapshot.uid.clone(),
            generation: rec.snapshot.generation,
            spec: rec.snapshot.spec.clone(),
        },
        ready_generation: rec.ready_generation,
    };
    let mut obj = DynamicObject::new(&rec.identity.name, &record_resource())
        .within(&rec.identity.namespace)
        .data(json!({ "spec": serde_json::to_value(spec).context("serializing record spec")? }));
    obj.metadata.resource_version = rec.version.clone();
    Ok(obj)
}

pub fn record_from_object(obj: &DynamicObject) -> Result<NotificationRecord> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("record missing metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().ok_or_else(|| anyhow!("record missing metadata.namespace"))?;
    let raw = obj.data.get("spec").cloned().ok_or_else(|| anyhow!("record {}/{} missing spec", namespace, name))?;
    let spec: RecordSpec = serde_json::from_value(raw).with_context(|| format!("decoding record {}/{}", namespace, name))?;
    Ok(NotificationRecord {
        identity: Identity { namespace, name },
        message: spec.message,
        snapshot: SpecSnapshot {
            uid: spec.deployment.uid,
            generation: spec.deployment.generation,
            spec: spec.deployment.spec,
        },
        ready_generation: spec.ready_generation,
        version: obj.metadata.resource_version.clone(),
    })
}

fn store_err(e: kube::Error, identity: &Identity, creating: bool) -> StoreError {
    match &e {
        kube::Error::Api(resp) if resp.code == 409 && creating => StoreError::AlreadyExists(identity.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(format!("{}: {}", identity, resp.message)),
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(identity.to_string()),
        _ => StoreError::Backend(anyhow::Error::new(e).context(format!("kube request for {}", identity))),
    }
}

/// Notification records stored as namespaced `herald.dev/v1` objects.
pub struct KubeRecords {
    client: Client,
    ar: ApiResource,
}

impl KubeRecords {
    pub fn new(client: Client) -> Self { Self { client, ar: record_resource() } }

    fn api(&self, ns: &str) -> Api<DynamicObject> { Api::namespaced_with(self.client.clone(), ns, &self.ar) }
}

#[async_trait::async_trait]
impl RecordStore for KubeRecords {
    async fn get(&self, identity: &Identity) -> Result<Option<NotificationRecord>, StoreError> {
        let found = self.api(&identity.namespace).get_opt(&identity.name).await.map_err(|e| store_err(e, identity, false))?;
        found.as_ref().map(record_from_object).transpose().map_err(StoreError::Backend)
    }

    async fn create(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let mut obj = record_to_object(record)?;
        obj.metadata.resource_version = None;
        let created = self
            .api(&record.identity.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| store_err(e, &record.identity, true))?;
        debug!(identity = %record.identity, rv = ?created.metadata.resource_version, "record created");
        Ok(record_from_object(&created)?)
    }

    async fn replace(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let obj = record_to_object(record)?;
        let replaced = self
            .api(&record.identity.namespace)
            .replace(&record.identity.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| store_err(e, &record.identity, false))?;
        Ok(record_from_object(&replaced)?)
    }
}

/// Start list+watch of Deployments matching `selector` and forward signals into `tx`.
/// Failed watches are re-established with backoff; this only returns once `tx` closes.
pub async fn start_watcher(client: Client, selector: &str, namespace: Option<&str>, tx: mpsc::Sender<Signal>) -> Result<()> {
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(selector);
    info!(selector = %selector, ns = ?namespace, "deployment watcher started");
    forward_events(watcher::watcher(api, cfg).default_backoff(), &tx).await;
    Ok(())
}

/// Turn watch events into signals until the stream ends or `tx` closes.
/// Watch errors (disconnects, expired resource versions) are logged and skipped.
pub async fn forward_events<S>(stream: S, tx: &mpsc::Sender<Signal>)
where
    S: Stream<Item = Result<Event<Deployment>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(ev) = stream.next().await {
        let signals: Vec<Signal> = match ev {
            Ok(Event::Applied(d)) => vec![Signal { identity: identity_of(&d), kind: SignalKind::Applied }],
            Ok(Event::Deleted(d)) => vec![Signal { identity: identity_of(&d), kind: SignalKind::Deleted }],
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(|d| Signal { identity: identity_of(d), kind: SignalKind::Applied }).collect()
            }
            Err(e) => {
                warn!(error = %e, "watch error; continuing");
                continue;
            }
        };
        for s in signals {
            if tx.send(s).await.is_err() {
                warn!("signal channel closed; stopping watcher");
                return;
            }
        }
    }
    warn!("watcher stream ended");
}

/// CustomResourceDefinition for the record kind, for `heraldctl crd`.
pub fn notification_crd() -> Json {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{}.{}", RECORD_PLURAL, RECORD_GROUP) },
        "spec": {
            "group": RECORD_GROUP,
            "scope": "Namespaced",
            "names": { "kind": RECORD_KIND, "plural": RECORD_PLURAL, "singular": "notification", "listKind": "NotificationList" },
            "versions": [{
                "name": RECORD_VERSION,
                "served": true,
                "storage": true,
                "schema": { "openAPIV3Schema": {
                    "type": "object",
                    "properties": { "spec": {
                        "type": "object",
                        "required": ["message", "deployment"],
                        "properties": {
                            "message": { "type": "string" },
                            "readyGeneration": { "type": "integer", "format": "int64" },
                            "deployment": {
                                "type": "object",
                                "required": ["generation"],
                                "properties": {
                                    "uid": { "type": "string" },
                                    "generation": { "type": "integer", "format": "int64" },
                                    "spec": { "type": "object", "x-kubernetes-preserve-unknown-fields": true }
                                }
                            }
                        }
                    }}
                }},
                "additionalPrinterColumns": [
                    { "name": "Generation", "type": "integer", "jsonPath": ".spec.deployment.generation" },
                    { "name": "Ready", "type": "integer", "jsonPath": ".spec.readyGeneration" },
                    { "name": "Message", "type": "string", "jsonPath": ".spec.message" }
                ]
            }]
        }
    })
}
