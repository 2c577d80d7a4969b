//! Explicit command registry.
//!
//! A handler declares a fixed list of [`CommandDescriptor`]s once at startup.
//! The resulting [`CommandRegistry`] is read-only and cheap to clone.

use crate::context::CurrentInvocation;
use crate::error::{CommandError, TaproomError, TaproomResult};
use crate::request::{CommandType, OutputType, Parameters, Request};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a command.
pub type CommandFuture = Pin<Box<dyn Future<Output = Result<Value, CommandError>> + Send>>;

/// Type-erased command function.
pub type CommandFn = Arc<dyn Fn(Invocation) -> CommandFuture + Send + Sync>;

/// Everything a command receives for one execution.
pub struct Invocation {
    /// Copy of the request being executed.
    pub request: Request,
    /// Parameters after binding (defaults applied).
    pub parameters: Parameters,
    /// The execution context, identical to what
    /// [`context::current`](crate::context::current) returns inside the command.
    pub context: Arc<CurrentInvocation>,
}

impl Invocation {
    /// Deserialize parameter `key`.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, CommandError> {
        let value = self.parameters.get(key).cloned().ok_or_else(|| {
            CommandError::new(format!("Missing parameter '{key}'")).with_class("ParameterError")
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Deserialize parameter `key`, treating absent or null as `None`.
    pub fn param_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CommandError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }
}

/// JSON kind a parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Integer,
    Float,
    Boolean,
    Dictionary,
    List,
    Any,
}

impl ParameterKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Integer => value.is_i64() || value.is_u64(),
            ParameterKind::Float => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::Dictionary => value.is_object(),
            ParameterKind::List => value.is_array(),
            ParameterKind::Any => true,
        }
    }
}

/// Declared command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub key: String,
    pub kind: ParameterKind,
    pub optional: bool,
    pub nullable: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn required(key: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            key: key.into(),
            kind,
            optional: false,
            nullable: false,
            default: None,
            description: None,
        }
    }

    pub fn optional(key: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            optional: true,
            ..Self::required(key, kind)
        }
    }

    /// Value used when the caller omits the parameter. Implies optional.
    pub fn with_default(mut self, default: Value) -> Self {
        self.optional = true;
        self.default = Some(default);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named command and how to invoke it.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Vec<ParameterSpec>,
    pub command_type: CommandType,
    pub output_type: OutputType,
    handler: CommandFn,
}

impl CommandDescriptor {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        let handler: CommandFn = Arc::new(move |invocation| Box::pin(handler(invocation)));
        Self {
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            command_type: CommandType::Action,
            output_type: OutputType::String,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_command_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    pub fn with_output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Check `supplied` against the declared parameters and fill defaults.
    ///
    /// The result keeps declaration order.
    pub fn bind(&self, supplied: &Parameters) -> Result<Parameters, String> {
        if let Some(unknown) = supplied
            .keys()
            .find(|key| !self.parameters.iter().any(|p| &p.key == *key))
        {
            return Err(format!(
                "Command '{}' has no parameter named '{}'",
                self.name, unknown
            ));
        }

        let mut bound = Parameters::new();
        for spec in &self.parameters {
            match supplied.get(&spec.key) {
                Some(Value::Null) if spec.nullable || spec.optional => {
                    bound.insert(spec.key.clone(), Value::Null);
                }
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(format!(
                            "Parameter '{}' of command '{}' expects {:?}, got {}",
                            spec.key, self.name, spec.kind, value
                        ));
                    }
                    bound.insert(spec.key.clone(), value.clone());
                }
                None => match (&spec.default, spec.optional) {
                    (Some(default), _) => {
                        bound.insert(spec.key.clone(), default.clone());
                    }
                    (None, true) => {}
                    (None, false) => {
                        return Err(format!(
                            "Command '{}' is missing required parameter '{}'",
                            self.name, spec.key
                        ))
                    }
                },
            }
        }
        Ok(bound)
    }

    pub(crate) fn call(&self, invocation: Invocation) -> CommandFuture {
        (self.handler)(invocation)
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("command_type", &self.command_type)
            .field("output_type", &self.output_type)
            .finish_non_exhaustive()
    }
}

/// An object whose methods are served as commands.
///
/// Implementations return closures that capture the shared `Arc<Self>`; the
/// framework adds no locking around it.
pub trait CommandHandler: Send + Sync + 'static {
    fn commands(self: Arc<Self>) -> Vec<CommandDescriptor>;
}

/// Read-only map of command name to descriptor.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: Arc<HashMap<String, CommandDescriptor>>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// Build a registry from every command `handler` declares.
    pub fn from_handler<H: CommandHandler>(handler: Arc<H>) -> TaproomResult<Self> {
        let mut builder = Self::builder();
        for descriptor in handler.commands() {
            builder.register(descriptor)?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// Mutable stage of a [`CommandRegistry`].
#[derive(Default)]
pub struct CommandRegistryBuilder {
    commands: HashMap<String, CommandDescriptor>,
}

impl CommandRegistryBuilder {
    pub fn register(&mut self, descriptor: CommandDescriptor) -> TaproomResult<&mut Self> {
        if descriptor.name.trim().is_empty() {
            return Err(TaproomError::Validation(
                "Command name must not be empty".to_string(),
            ));
        }
        if self.commands.contains_key(&descriptor.name) {
            return Err(TaproomError::Validation(format!(
                "Command '{}' is already registered",
                descriptor.name
            )));
        }
        self.commands.insert(descriptor.name.clone(), descriptor);
        Ok(self)
    }

    /// Register a bare function under `name` with no declared parameters
    /// other than those listed.
    pub fn register_command<F, Fut>(
        &mut self,
        name: &str,
        parameters: Vec<ParameterSpec>,
        handler: F,
    ) -> TaproomResult<&mut Self>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        let descriptor = parameters
            .into_iter()
            .fold(CommandDescriptor::new(name, handler), |d, p| {
                d.with_parameter(p)
            });
        self.register(descriptor)
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            commands: Arc::new(self.commands),
        }
    }
}
