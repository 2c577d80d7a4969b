//! taproom-worker: serves a demo `echo` system over Redis Streams.
//!
//! Usage: taproom-worker [--system <name>] [--version <v>] [--api-url <url>]
//!
//! Without `--api-url`, request status is kept in process memory.

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taproom::{
    CommandDescriptor, CommandHandler, HttpRequestStore, InvokeOptions, Invocation,
    MemoryRequestStore, OutputType, ParameterKind, ParameterSpec, Parameters, RedisBroker,
    RedisBrokerConfig, RequestStore, RpcClient, RpcClientConfig, StatusPublisher, VersionResolver,
    Worker, WorkerConfig,
};
use tracing::{error, info, warn};

/// Serve the demo echo system from a broker queue.
#[derive(Parser, Debug)]
#[command(name = "taproom-worker")]
#[command(about = "Serve commands delivered through Redis Streams")]
struct Args {
    /// System name served by this worker.
    #[arg(long, env = "TAPROOM_SYSTEM", default_value = "echo")]
    system: String,

    /// Concrete system version.
    #[arg(long = "system-version", env = "TAPROOM_VERSION", default_value = "1.0.0")]
    version: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Base URL of the request API.
    #[arg(long, env = "TAPROOM_API_URL")]
    api_url: Option<String>,

    /// Commands executing at once.
    #[arg(long, env = "TAPROOM_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write JSONL logs to this file.
    #[arg(long, env = "TAPROOM_LOG_FILE")]
    log_file: Option<PathBuf>,
}

/// Demo handler.
struct Echo {
    client: Arc<RpcClient>,
}

impl CommandHandler for Echo {
    fn commands(self: Arc<Self>) -> Vec<CommandDescriptor> {
        let me = self.clone();
        vec![
            CommandDescriptor::new("say", |inv: Invocation| async move {
                let message: String = inv.param("message")?;
                let loud: bool = inv.param("loud")?;
                Ok(Value::String(if loud {
                    message.to_uppercase()
                } else {
                    message
                }))
            })
            .with_description("Return the message")
            .with_parameter(ParameterSpec::required("message", ParameterKind::String))
            .with_parameter(
                ParameterSpec::optional("loud", ParameterKind::Boolean).with_default(json!(false)),
            ),
            CommandDescriptor::new("echo_json", |inv: Invocation| async move {
                Ok(inv.parameters.get("payload").cloned().unwrap_or(Value::Null))
            })
            .with_description("Return the payload as JSON")
            .with_output_type(OutputType::Json)
            .with_parameter(ParameterSpec::required("payload", ParameterKind::Any)),
            CommandDescriptor::new("say_many", move |inv: Invocation| {
                let me = me.clone();
                async move {
                    let message: String = inv.param("message")?;
                    let times: u64 = inv.param("times")?;
                    let mut replies = Vec::new();
                    for _ in 0..times {
                        let mut params = Parameters::new();
                        params.insert("message".into(), json!(message));
                        let child = me
                            .client
                            .invoke("say", params, InvokeOptions::default().raise_on_error(true))
                            .await?;
                        replies.push(child.output.unwrap_or(Value::Null));
                    }
                    Ok(Value::Array(replies))
                }
            })
            .with_description("Call `say` on this system several times")
            .with_output_type(OutputType::Json)
            .with_parameter(ParameterSpec::required("message", ParameterKind::String))
            .with_parameter(
                ParameterSpec::optional("times", ParameterKind::Integer).with_default(json!(2)),
            ),
        ]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "taproom-worker".into(),
        default_level: args.log_level.clone(),
        log_path: args.log_file.clone(),
        also_stderr: true,
    })
    .context("failed to initialize logging")?;

    let mut config = WorkerConfig::new(&args.system, &args.version)?;
    if let Some(url) = args.redis_url {
        config.redis_url = url;
    }
    if let Some(url) = args.api_url {
        config.api_url = Some(url);
    }
    if let Some(n) = args.max_concurrent {
        config.max_concurrent = n;
    }
    config.validate()?;

    info!(
        worker = %config.identity(),
        redis_url = %config.redis_url,
        api_url = ?config.api_url,
        max_concurrent = config.max_concurrent,
        "Configuration loaded"
    );

    let (store, resolver): (Arc<dyn RequestStore>, Arc<dyn VersionResolver>) = match &config.api_url
    {
        Some(url) => {
            let http = Arc::new(HttpRequestStore::new(url.clone(), config.api_timeout)?);
            (
                http.clone() as Arc<dyn RequestStore>,
                http as Arc<dyn VersionResolver>,
            )
        }
        None => {
            warn!("No request API configured, keeping request status in memory");
            let memory = Arc::new(MemoryRequestStore::new());
            memory.register_system(&config.namespace, &config.system, &config.version);
            (
                memory.clone() as Arc<dyn RequestStore>,
                memory as Arc<dyn VersionResolver>,
            )
        }
    };

    let mut client_config = RpcClientConfig::new(&config.system);
    client_config.instance = config.instance.clone();
    client_config.namespaces = vec![config.namespace.clone()];
    client_config.timeout = Some(Duration::from_secs(60));
    let client = Arc::new(RpcClient::new(client_config, store.clone(), resolver)?);

    let registry = taproom::CommandRegistry::from_handler(Arc::new(Echo { client }))?;
    let publisher = Arc::new(StatusPublisher::new(store, config.backoff));

    let request_broker = RedisBroker::connect(RedisBrokerConfig::new(
        &config.redis_url,
        &config.consumer_group,
    ))
    .await?;
    let admin_broker = RedisBroker::connect(RedisBrokerConfig::new(
        &config.redis_url,
        &config.consumer_group,
    ))
    .await?;

    let mut handle = Worker::new(config, registry, publisher)?.start(request_broker, admin_broker)?;

    let ctrl_c = tokio::signal::ctrl_c();
    let waited = tokio::select! {
        result = handle.wait() => result,
        _ = ctrl_c => {
            info!("Received shutdown signal, stopping...");
            Ok(())
        }
    };

    let stopped = handle.stop().await;
    if let Err(e) = waited.and(stopped) {
        error!(error = %e, "Worker exited with error");
        return Err(e.into());
    }
    Ok(())
}
