//! The request model: one command invocation and its eventual result.

use crate::status::RequestStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque request identifier.
pub type RequestId = String;

/// Insertion-ordered command parameters.
pub type Parameters = Map<String, Value>;

/// Version token that resolves to the newest registered version.
pub const LATEST_VERSION: &str = "latest";

/// How a command is routed and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    #[default]
    Action,
    Info,
    /// Executed, but status updates are never published.
    Ephemeral,
    /// Served on the admin queue.
    Admin,
}

/// How a command's output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputType {
    #[default]
    String,
    Json,
}

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub system: String,
    pub version: String,
    pub namespace: String,
    pub instance: String,
}

impl Target {
    pub fn new(
        system: impl Into<String>,
        version: impl Into<String>,
        namespace: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            version: version.into(),
            namespace: namespace.into(),
            instance: instance.into(),
        }
    }
}

/// One command invocation and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    pub system: String,
    pub system_version: String,
    pub namespace: String,
    pub instance_name: String,
    pub command: String,

    #[serde(default)]
    pub command_type: CommandType,
    #[serde(default)]
    pub output_type: OutputType,

    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    pub status: RequestStatus,

    /// Id of the parent request, if any. Children are found by query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RequestId>,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a new `CREATED` request for `command` on `target`.
    pub fn new(target: &Target, command: impl Into<String>, parameters: Parameters) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            system: target.system.clone(),
            system_version: target.version.clone(),
            namespace: target.namespace.clone(),
            instance_name: target.instance.clone(),
            command: command.into(),
            command_type: CommandType::default(),
            output_type: OutputType::default(),
            parameters,
            comment: None,
            metadata: Map::new(),
            output: None,
            error: None,
            error_class: None,
            status: RequestStatus::Created,
            parent: None,
            hidden: false,
            created_at: Some(now),
            updated_at: Some(now),
            status_updated_at: Some(now),
        }
    }

    /// The target this request is addressed to.
    pub fn target(&self) -> Target {
        Target::new(
            &self.system,
            &self.system_version,
            &self.namespace,
            &self.instance_name,
        )
    }

    /// Assign a fresh id if none is set yet, returning the id.
    pub fn ensure_id(&mut self) -> &str {
        self.id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .as_str()
    }

    /// Id, or a placeholder for log lines.
    pub fn id_or_unassigned(&self) -> &str {
        self.id.as_deref().unwrap_or("<unassigned>")
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.command_type == CommandType::Ephemeral
    }

    pub fn is_json(&self) -> bool {
        self.output_type == OutputType::Json
    }

    /// Set the status locally. No lattice validation happens here.
    ///
    /// `status_updated_at` moves only when the value changes; all
    /// timestamps stay non-decreasing.
    pub fn set_status(&mut self, status: RequestStatus) {
        let now = self.next_timestamp();
        if self.status != status {
            self.status = status;
            self.status_updated_at = Some(now);
        }
        self.updated_at = Some(now);
    }

    /// Record a successful result.
    pub fn succeed(&mut self, output: Value) {
        self.output = Some(output);
        self.error = None;
        self.error_class = None;
        self.set_status(RequestStatus::Success);
    }

    /// Record a terminal failure with a human-readable message.
    pub fn fail(&mut self, status: RequestStatus, message: impl Into<String>, class: &str) {
        let message = message.into();
        if self.is_json() {
            self.output = Some(serde_json::json!({
                "message": message,
                "class": class,
            }));
        } else {
            self.output = Some(Value::String(message.clone()));
        }
        self.error = Some(message);
        self.error_class = Some(class.to_string());
        self.set_status(status);
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        [self.updated_at, self.status_updated_at, self.created_at]
            .into_iter()
            .flatten()
            .fold(now, |acc, t| acc.max(t))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {}/{}@{}:{}",
            self.command,
            self.id_or_unassigned(),
            self.namespace,
            self.system,
            self.system_version,
            self.instance_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> Target {
        Target::new("echo", "1.0.0", "default", "default")
    }

    #[test]
    fn test_new_request_is_created_without_id() {
        let request = Request::new(&target(), "say", Parameters::new());
        assert_eq!(request.status, RequestStatus::Created);
        assert!(request.id.is_none());
        assert_eq!(request.target(), target());
    }

    #[test]
    fn test_ensure_id_assigns_once() {
        let mut request = Request::new(&target(), "say", Parameters::new());
        let first = request.ensure_id().to_string();
        let second = request.ensure_id().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_status_timestamp_moves_only_on_change() {
        let mut request = Request::new(&target(), "say", Parameters::new());
        request.set_status(RequestStatus::InProgress);
        let status_at = request.status_updated_at;

        request.set_status(RequestStatus::InProgress);
        assert_eq!(request.status_updated_at, status_at);
        assert!(request.updated_at >= status_at);

        request.set_status(RequestStatus::Success);
        assert!(request.status_updated_at >= status_at);
        assert!(request.updated_at >= request.created_at);
    }

    #[test]
    fn test_local_mutation_is_unrestricted() {
        let mut request = Request::new(&target(), "say", Parameters::new());
        request.set_status(RequestStatus::Success);
        request.set_status(RequestStatus::Created);
        assert_eq!(request.status, RequestStatus::Created);
    }

    #[test]
    fn test_fail_renders_json_output_for_json_commands() {
        let mut request = Request::new(&target(), "say", Parameters::new());
        request.output_type = OutputType::Json;
        request.fail(RequestStatus::Error, "boom", "ValueError");

        assert_eq!(request.error.as_deref(), Some("boom"));
        assert_eq!(
            request.output,
            Some(json!({"message": "boom", "class": "ValueError"}))
        );
    }

    #[test]
    fn test_parameters_keep_insertion_order() {
        let mut params = Parameters::new();
        params.insert("zeta".into(), json!(1));
        params.insert("alpha".into(), json!(2));
        let request = Request::new(&target(), "say", params);

        let encoded = serde_json::to_string(&request.parameters).unwrap();
        assert_eq!(encoded, r#"{"zeta":1,"alpha":2}"#);
    }
}
