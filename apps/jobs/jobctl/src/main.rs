//! Command-line publisher for the job runtime.
//!
//! ```text
//! jobctl publish --job MailerJob --topic jobs.mail --data '[42, "welcome"]'
//! jobctl publish --job MailerJob --data '{"user": 42, "template": "welcome"}'
//! jobctl publish-raw --topic jobs.mail.dlq --data '{"args":[42]}'
//! ```
//!
//! Broker settings come from the usual `JOBS_*` environment variables.

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use job_runtime::{JobEnvelope, JobRuntime, Payload, RuntimeConfig, DEFAULT_HANDLER_METHOD};
use serde_json::{json, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish jobs to the job broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue a job envelope
    Publish {
        /// Job name carried in the envelope
        #[arg(long)]
        job: String,

        /// Handler method to invoke
        #[arg(long, default_value = DEFAULT_HANDLER_METHOD)]
        method: String,

        /// Topic to publish to (defaults to JOBS_DEFAULT_TOPIC)
        #[arg(long)]
        topic: Option<String>,

        /// Arguments as JSON: an array, an object (values in key order) or a single value
        #[arg(long, default_value = "[]")]
        data: String,
    },

    /// Send a body unchanged
    PublishRaw {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        data: String,
    },
}

/// Positional arguments for `--data`, with the same rules a worker applies to `args`.
fn parse_args(data: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(data).wrap_err("--data is not valid JSON")?;
    Payload::Json(json!({ "args": value }))
        .args()
        .map_err(|e| eyre!(e))
}

fn resolve_topic(topic: Option<String>, config: &RuntimeConfig) -> Result<String> {
    topic
        .or_else(|| config.default_topic.clone())
        .ok_or_else(|| eyre!("no --topic given and JOBS_DEFAULT_TOPIC is not set"))
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();
    init_tracing(&Environment::from_env());

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env().wrap_err("Failed to load job runtime configuration")?;
    let runtime = JobRuntime::nats(config);

    let result = async {
        match cli.command {
            Command::Publish {
                job,
                method,
                topic,
                data,
            } => {
                let topic = resolve_topic(topic, runtime.config())?;
                let envelope = JobEnvelope::new(&job, &method, parse_args(&data)?);
                runtime
                    .publisher()
                    .publish_envelope(&topic, &envelope)
                    .await
                    .wrap_err_with(|| format!("Failed to publish {job} to {topic}"))?;
                info!(job = %job, method = %method, topic = %topic, args = envelope.args.len(), "Job published");
            }
            Command::PublishRaw { topic, data } => {
                let bytes = data.len();
                runtime
                    .publisher()
                    .publish_raw(&topic, data.into_bytes())
                    .await
                    .wrap_err_with(|| format!("Failed to publish to {topic}"))?;
                info!(topic = %topic, bytes = bytes, "Raw message published");
            }
        }
        Ok::<_, eyre::Report>(())
    }
    .await;

    runtime.shutdown().await;
    result
}
