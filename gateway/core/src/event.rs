use crate::{backend::RawWatchEvent, ClusterId, ResourceType};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A resource change observed on a cluster, normalized across transports.
///
/// Events are produced by watch loops, fanned out by the event hub, and never
/// stored.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub cluster: ClusterId,
    pub resource: ResourceType,
    pub namespace: Option<String>,
    pub object: Arc<DynamicObject>,
    pub resource_version: Option<String>,
}

// === impl EventType ===

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl WatchEvent ===

impl WatchEvent {
    pub fn new(
        event_type: EventType,
        cluster: ClusterId,
        resource: ResourceType,
        object: DynamicObject,
    ) -> Self {
        Self {
            event_type,
            cluster,
            resource,
            namespace: object.metadata.namespace.clone(),
            resource_version: object.metadata.resource_version.clone(),
            object: Arc::new(object),
        }
    }

    /// Normalizes a raw watch notification. Bookmarks and errors carry no
    /// object change and yield `None`.
    pub fn from_raw(cluster: ClusterId, resource: ResourceType, raw: RawWatchEvent) -> Option<Self> {
        let (event_type, object) = match raw {
            RawWatchEvent::Added(obj) => (EventType::Added, obj),
            RawWatchEvent::Modified(obj) => (EventType::Modified, obj),
            RawWatchEvent::Deleted(obj) => (EventType::Deleted, obj),
            RawWatchEvent::Bookmark(_) | RawWatchEvent::Error(_) => return None,
        };
        Some(Self::new(event_type, cluster, resource, object))
    }

    pub fn name(&self) -> Option<&str> {
        self.object.metadata.name.as_deref()
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.object.metadata.labels.as_ref()
    }
}
