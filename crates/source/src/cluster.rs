//! Kubernetes-backed source: discovery plus list/watch over `DynamicObject`.

use anyhow::{anyhow, Context, Result};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tether_core::ResourceObject;
use tracing::{debug, info, warn};

use crate::{Change, ChangeStream, EventSource, Listing};

/// Server-side watch timeout; the informer re-watches when it expires.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// One resource type the API server serves, as printed by `tetherctl discover`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    fn new(ar: &ApiResource, namespaced: bool) -> Self {
        Self { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone(), namespaced }
    }

    /// Key accepted by [`KubeSource::for_gvk`].
    pub fn gvk_key(&self) -> String {
        match self.group.as_str() {
            "" => format!("{}/{}", self.version, self.kind),
            group => format!("{}/{}/{}", group, self.version, self.kind),
        }
    }
}

/// Preferred version of every served resource, with its scope.
async fn served_resources(client: Client) -> Result<Vec<(ApiResource, bool)>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    Ok(discovery
        .groups()
        .flat_map(|g| g.recommended_resources())
        .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
        .collect())
}

/// Every resource type the current cluster serves, sorted by GVK.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await.context("building kube client")?;
    let mut out: Vec<DiscoveredResource> =
        served_resources(client).await?.iter().map(|(ar, namespaced)| DiscoveredResource::new(ar, *namespaced)).collect();
    out.sort();
    debug!(count = out.len(), "discovery complete");
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    served_resources(client)
        .await?
        .into_iter()
        .find(|(ar, _)| ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind)
        .ok_or_else(|| anyhow!("{}/{}/{} is not served by this cluster", gvk.group, gvk.version, gvk.kind))
}

fn object_from(obj: &DynamicObject) -> Result<ResourceObject> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    ResourceObject::from_raw(raw).context("admitting object")
}

fn translate(ev: kube::Result<WatchEvent<DynamicObject>>) -> Result<Option<Change>> {
    match ev.context("watch stream")? {
        WatchEvent::Added(o) => Ok(Some(Change::Added(object_from(&o)?))),
        WatchEvent::Modified(o) => Ok(Some(Change::Modified(object_from(&o)?))),
        WatchEvent::Deleted(o) => Ok(Some(Change::Deleted(object_from(&o)?))),
        WatchEvent::Bookmark(_) => Ok(None),
        // 410 Gone and friends: the resume point is lost, relist
        WatchEvent::Error(e) => Err(anyhow!("watch error {}: {} ({})", e.code, e.message, e.reason)),
    }
}

/// List+watch over one GVK, cluster-wide or within a namespace.
pub struct KubeSource {
    api: Api<DynamicObject>,
    label: String,
    label_selector: Option<String>,
}

impl KubeSource {
    pub fn new(api: Api<DynamicObject>, label: impl Into<String>) -> Self {
        Self { api, label: label.into(), label_selector: None }
    }

    /// Resolve `gvk_key` (`v1/Kind` or `group/v1/Kind`) through discovery.
    pub async fn for_gvk(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        let label = match namespace {
            Some(ns) if namespaced => format!("{} in {}", gvk_key, ns),
            _ => gvk_key.to_string(),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube source ready");
        Ok(Self::new(api, label))
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

#[async_trait::async_trait]
impl EventSource for KubeSource {
    fn describe(&self) -> String { self.label.clone() }

    async fn list_all(&self) -> Result<Listing> {
        let mut lp = ListParams::default();
        if let Some(sel) = &self.label_selector {
            lp = lp.labels(sel);
        }
        let list = self.api.list(&lp).await.with_context(|| format!("listing {}", self.label))?;
        let objects = list.items.iter().map(object_from).collect::<Result<Vec<_>>>()?;
        counter!("source_lists_total", 1);
        debug!(source = %self.label, count = objects.len(), rv = ?list.metadata.resource_version, "list ok");
        Ok(Listing { objects, resource_version: list.metadata.resource_version })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<ChangeStream> {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(sel) = &self.label_selector {
            wp = wp.labels(sel);
        }
        let rv = resource_version.unwrap_or("0");
        let stream = self.api.watch(&wp, rv).await.with_context(|| format!("starting watch on {}", self.label))?;
        let label = self.label.clone();
        let changes = stream
            .map(translate)
            .try_filter_map(|c| futures::future::ready(Ok(c)))
            .inspect_err(move |e| warn!(source = %label, error = %e, "watch event rejected"));
        Ok(changes.boxed())
    }
}
