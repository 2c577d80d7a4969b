//! Broker message envelope and queue naming.
//!
//! Every message body is a JSON-encoded [`InvocationMessage`].

use crate::error::{TaproomError, TaproomResult};
use crate::request::{Request, Target};
use serde::{Deserialize, Serialize};

/// Prefix for every queue key.
pub const QUEUE_PREFIX: &str = "taproom";

/// Which of an instance's two queues a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Request,
    Admin,
}

impl QueueKind {
    fn suffix(self) -> &'static str {
        match self {
            QueueKind::Request => "request",
            QueueKind::Admin => "admin",
        }
    }
}

/// Queue key for `target`, e.g. `taproom:default:echo:1.0.0:default:request`.
pub fn queue_key(target: &Target, kind: QueueKind) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        QUEUE_PREFIX,
        target.namespace,
        target.system,
        target.version,
        target.instance,
        kind.suffix()
    )
}

/// Delivery bookkeeping carried alongside the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// How many times this message has been redelivered by the sender.
    #[serde(default)]
    pub retry_attempt: u32,
    /// Free-form sender tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A request plus its delivery headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub request: Request,
    #[serde(default)]
    pub headers: MessageHeaders,
}

impl InvocationMessage {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            headers: MessageHeaders::default(),
        }
    }

    /// Encode to the wire body.
    pub fn encode(&self) -> TaproomResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire body and check that the request is well-formed.
    pub fn decode(payload: &[u8]) -> TaproomResult<Self> {
        let message: InvocationMessage = serde_json::from_slice(payload)
            .map_err(|e| TaproomError::Decode(format!("Unable to parse message body: {e}")))?;
        message.check_well_formed()?;
        Ok(message)
    }

    fn check_well_formed(&self) -> TaproomResult<()> {
        let request = &self.request;
        match request.id.as_deref() {
            None | Some("") => {
                return Err(TaproomError::Decode(
                    "Message request has no id".to_string(),
                ))
            }
            Some(_) => {}
        }
        let required = [
            ("command", &request.command),
            ("system", &request.system),
            ("system_version", &request.system_version),
            ("instance_name", &request.instance_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TaproomError::Decode(format!(
                    "Message request is missing {field}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Parameters;
    use serde_json::json;

    fn message() -> InvocationMessage {
        let target = Target::new("echo", "1.0.0", "default", "default");
        let mut params = Parameters::new();
        params.insert("msg".into(), json!("hi"));
        let mut request = Request::new(&target, "say", params);
        request.ensure_id();
        InvocationMessage::new(request)
    }

    #[test]
    fn test_queue_key_format() {
        let target = Target::new("echo", "1.0.0", "prod", "i1");
        assert_eq!(
            queue_key(&target, QueueKind::Request),
            "taproom:prod:echo:1.0.0:i1:request"
        );
        assert_eq!(
            queue_key(&target, QueueKind::Admin),
            "taproom:prod:echo:1.0.0:i1:admin"
        );
    }

    #[test]
    fn test_decode_preserves_request() {
        let original = message();
        let decoded = InvocationMessage::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.request.parameters["msg"], json!("hi"));
        assert_eq!(decoded.request.id, original.request.id);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = InvocationMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, TaproomError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let mut msg = message();
        msg.request.id = None;
        let err = InvocationMessage::decode(&msg.encode().unwrap()).unwrap_err();
        assert!(matches!(err, TaproomError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_blank_command() {
        let mut msg = message();
        msg.request.command = "  ".into();
        let err = InvocationMessage::decode(&msg.encode().unwrap()).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_headers_default_when_absent() {
        let msg = message();
        let mut value = serde_json::to_value(&msg).unwrap();
        value.as_object_mut().unwrap().remove("headers");
        let decoded = InvocationMessage::decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded.headers, MessageHeaders::default());
    }
}
