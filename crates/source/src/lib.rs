//! Tether event sources: the list+watch capability the informer drives.
//!
//! A source only has to answer two questions: "what exists right now"
//! (`list_all`) and "what changed since version X" (`watch`). Reconnects,
//! relists and periodic resync are driven by the informer on top of it.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod memory;

use anyhow::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tether_core::{Delta, DeltaKind, ResourceKey, ResourceObject};

pub use cluster::{discover, DiscoveredResource, KubeSource};
pub use memory::{MemorySource, DEFAULT_HISTORY_LIMIT};

/// Complete snapshot returned by a list call.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ResourceObject>,
    /// Version to resume watching from, when the transport has one.
    pub resource_version: Option<String>,
}

/// One incremental change delivered by a watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    Added(ResourceObject),
    Modified(ResourceObject),
    Deleted(ResourceObject),
}

impl Change {
    pub fn object(&self) -> &ResourceObject {
        match self {
            Change::Added(o) | Change::Modified(o) | Change::Deleted(o) => o,
        }
    }

    pub fn key(&self) -> &ResourceKey { &self.object().key }

    pub fn into_delta(self) -> Delta {
        match self {
            Change::Added(object) => Delta { kind: DeltaKind::Added, object },
            Change::Modified(object) => Delta { kind: DeltaKind::Updated, object },
            Change::Deleted(object) => Delta { kind: DeltaKind::Deleted, object },
        }
    }
}

/// Incremental changes; an `Err` item or the end of the stream means the
/// connection is gone and the caller must relist.
pub type ChangeStream = BoxStream<'static, Result<Change>>;

/// List+watch transport for one resource type.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Complete snapshot at call time.
    async fn list_all(&self) -> Result<Listing>;

    /// Changes after `resource_version` (from the latest listing).
    async fn watch(&self, resource_version: Option<&str>) -> Result<ChangeStream>;
}
