//! The newline-delimited JSON protocol spoken with subscribers.

use crate::hub::Outbound;
use fleet_gateway_core::{ClusterId, EventType, ResourceType};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// A message a subscriber sends.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        id: String,
        cluster_id: ClusterId,
        resource_type: ResourceType,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        label_selector: Option<String>,
    },
    Unsubscribe {
        id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Event(Envelope<'a>),
    Subscribed {
        id: &'a str,
    },
    Unsubscribed {
        id: &'a str,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
        message: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    cluster_id: &'a ClusterId,
    resource_type: &'a ResourceType,
    namespace: Option<&'a str>,
    #[serde(rename = "type")]
    event_type: EventType,
    object: &'a DynamicObject,
}

/// Parses a line received from a subscriber.
pub fn decode(line: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(line)
}

/// Renders a queued message as a single line of JSON, without the trailing
/// newline.
pub fn encode(msg: &Outbound) -> Result<String, serde_json::Error> {
    let msg = match msg {
        Outbound::Event(ev) => ServerMessage::Event(Envelope {
            cluster_id: &ev.cluster,
            resource_type: &ev.resource,
            namespace: ev.namespace.as_deref(),
            event_type: ev.event_type,
            object: &ev.object,
        }),
        Outbound::Subscribed { id } => ServerMessage::Subscribed { id },
        Outbound::Unsubscribed { id } => ServerMessage::Unsubscribed { id },
        Outbound::Error { id, message } => ServerMessage::Error {
            id: id.as_deref(),
            message,
        },
    };
    serde_json::to_string(&msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_gateway_core::WatchEvent;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn decodes_client_messages() {
        let msg = decode(
            r#"{"op":"subscribe","id":"s1","clusterId":"c1","resourceType":"_/v1/pods","namespace":"default"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                id: "s1".to_string(),
                cluster_id: ClusterId::from("c1"),
                resource_type: "v1/pods".parse().unwrap(),
                namespace: Some("default".to_string()),
                label_selector: None,
            }
        );

        let msg = decode(r#"{"op":"unsubscribe","id":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unsubscribe {
                id: "s1".to_string()
            }
        );

        assert!(decode(r#"{"op":"subscribe","id":"s1"}"#).is_err());
        assert!(decode(r#"{"op":"subscribe","id":"s1","clusterId":"c1","resourceType":"pods"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encodes_event_envelopes() {
        let object = serde_json::from_value::<DynamicObject>(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "shop" },
        }))
        .unwrap();
        let event = WatchEvent::new(
            EventType::Modified,
            ClusterId::from("c2"),
            "apps/v1/deployments".parse().unwrap(),
            object,
        );

        let line = encode(&Outbound::Event(Arc::new(event))).unwrap();
        let value = serde_json::from_str::<serde_json::Value>(&line).unwrap();
        assert_eq!(value["kind"], "event");
        assert_eq!(value["clusterId"], "c2");
        assert_eq!(value["resourceType"], "apps/v1/deployments");
        assert_eq!(value["namespace"], "shop");
        assert_eq!(value["type"], "modified");
        assert_eq!(value["object"]["metadata"]["name"], "web");
    }

    #[test]
    fn encodes_replies() {
        let line = encode(&Outbound::Subscribed {
            id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(line, r#"{"kind":"subscribed","id":"s1"}"#);

        let line = encode(&Outbound::Error {
            id: None,
            message: "invalid message".to_string(),
        })
        .unwrap();
        assert_eq!(line, r#"{"kind":"error","message":"invalid message"}"#);
    }
}
