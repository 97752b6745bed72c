//! rapidfire main binary.
//!
//! Coalesces rapid-fire chat fragments per sender and forwards each finished
//! burst as one merged message.

mod config;
mod dispatch;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "rapidfire", version, about = "Rapid-fire message coalescing service")]
struct Cli {
    /// Path to config.toml (default: ~/.rapidfire/config.toml).
    #[arg(long, global = true, env = "RAPIDFIRE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the ingress server and coalescing poller (default).
    Serve,
    /// Validate config and check store connectivity.
    Doctor,
    /// Print pending batch statistics as JSON.
    Stats,
    /// Append one fragment for a sender.
    Enqueue {
        sender: String,
        text: String,
        /// Opaque JSON forwarded with the merged batch.
        #[arg(long)]
        routing_context: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Dispatch every pending batch now, ignoring the idle timeout.
    Flush,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(config_path).await,
        Command::Doctor => server::doctor(config_path).await,
        Command::Stats => server::stats(config_path).await,
        Command::Enqueue {
            sender,
            text,
            routing_context,
            metadata,
        } => {
            let routing_context = parse_json_arg("--routing-context", routing_context)?;
            let metadata = parse_json_arg("--metadata", metadata)?;
            server::enqueue_one_shot(config_path, &sender, &text, routing_context, metadata).await
        }
        Command::Flush => server::flush(config_path).await,
    }
}

fn parse_json_arg(flag: &str, raw: Option<String>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("{flag} must be valid JSON: {e}")),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,rapidfire=debug,rf_app=debug,rf_batch=debug,rf_store=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("RAPIDFIRE_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported RAPIDFIRE_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
