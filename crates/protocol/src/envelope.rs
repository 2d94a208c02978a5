use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for all communication with the local twin layer.
///
/// Mirrors the Ditto protocol shape: a routing `topic`, a resource `path`,
/// pass-through `headers`, an optional JSON `value` and, on responses, an
/// HTTP-like `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Value>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Envelope {
    /// Twin modify command replacing a whole feature.
    pub fn feature_modify(device_id: &str, feature: &str, value: Value) -> Self {
        Self {
            topic: twin_modify_topic(device_id),
            headers: HashMap::new(),
            path: format!("/features/{feature}"),
            value: Some(value),
            status: None,
        }
    }

    /// Twin modify command for a single feature property.
    pub fn property_modify(device_id: &str, feature: &str, property: &str, value: Value) -> Self {
        Self {
            topic: twin_modify_topic(device_id),
            headers: HashMap::new(),
            path: format!("/features/{feature}/properties/{property}"),
            value: Some(value),
            status: None,
        }
    }

    /// Live message originating from a feature outbox.
    pub fn outbox_message(device_id: &str, feature: &str, subject: &str, value: Value) -> Self {
        let (namespace, name) = split_device_id(device_id);
        Self {
            topic: format!("{namespace}/{name}/things/live/messages/{subject}"),
            headers: HashMap::from([(
                "content-type".to_string(),
                Value::String("application/json".to_string()),
            )]),
            path: format!("/features/{feature}/outbox/messages/{subject}"),
            value: Some(value),
            status: None,
        }
    }

    /// Response to this envelope: topic and headers preserved, the path
    /// switched from inbox to outbox, the given status and value filled in.
    pub fn reply(&self, status: u16, value: Option<Value>) -> Self {
        Self {
            topic: self.topic.clone(),
            headers: self.headers.clone(),
            path: self.path.replacen("/inbox/", "/outbox/", 1),
            value,
            status: Some(status),
        }
    }
}

fn twin_modify_topic(device_id: &str) -> String {
    let (namespace, name) = split_device_id(device_id);
    format!("{namespace}/{name}/things/twin/commands/modify")
}

/// Splits a `namespace:name` device identifier. A missing namespace yields
/// an empty one.
fn split_device_id(device_id: &str) -> (&str, &str) {
    device_id.split_once(':').unwrap_or(("", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_modify_paths() {
        let env =
            Envelope::property_modify("org.acme:dev-1", "AutoUploadable", "lastUpload", json!(1));
        assert_eq!(env.topic, "org.acme/dev-1/things/twin/commands/modify");
        assert_eq!(env.path, "/features/AutoUploadable/properties/lastUpload");
        assert_eq!(env.value, Some(json!(1)));
        assert!(env.status.is_none());
    }

    #[test]
    fn outbox_message_topic_and_path() {
        let env =
            Envelope::outbox_message("org.acme:dev-1", "AutoUploadable", "request", json!({}));
        assert_eq!(env.topic, "org.acme/dev-1/things/live/messages/request");
        assert_eq!(env.path, "/features/AutoUploadable/outbox/messages/request");
    }

    #[test]
    fn reply_switches_inbox_to_outbox() {
        let request = Envelope {
            topic: "org.acme/dev-1/things/live/messages/trigger".into(),
            headers: HashMap::from([("correlation-id".to_string(), json!("r-1"))]),
            path: "/features/AutoUploadable/inbox/messages/trigger".into(),
            value: Some(json!({"correlationId": "u-1"})),
            status: None,
        };

        let reply = request.reply(204, None);
        assert_eq!(reply.topic, request.topic);
        assert_eq!(reply.headers, request.headers);
        assert_eq!(reply.path, "/features/AutoUploadable/outbox/messages/trigger");
        assert_eq!(reply.status, Some(204));
        assert!(reply.value.is_none());
    }

    #[test]
    fn reply_carries_error_message() {
        let request = Envelope {
            topic: "t".into(),
            headers: HashMap::new(),
            path: "/features/f/inbox/messages/start".into(),
            value: None,
            status: None,
        };
        let reply = request.reply(404, Some(json!("upload with correlation ID 'x' not found")));
        assert_eq!(reply.status, Some(404));
        assert!(reply.value.unwrap().as_str().unwrap().contains("not found"));
    }

    #[test]
    fn json_roundtrip_omits_empty_fields() {
        let env =
            Envelope::feature_modify("org.acme:dev-1", "AutoUploadable", json!({"properties": {}}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("\"headers\""));
        assert!(!text.contains("\"status\""));

        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn device_id_without_namespace() {
        let env = Envelope::property_modify("dev-1", "f", "p", json!(null));
        assert_eq!(env.topic, "/dev-1/things/twin/commands/modify");
    }
}
