//! SDR agent main binary.

mod config;
mod conversation;
mod db;
mod followup;
mod message_buffer;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "sdr-agent", version, about = "WhatsApp SDR agent core")]
struct Cli {
    /// Config file (defaults to ~/.sdr-agent/config.toml).
    #[arg(long, global = true, env = "SDR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the webhook server and background workers (default).
    Serve,
    /// Validate config and open the database.
    Doctor,
    /// One-shot WhatsApp send.
    Send { phone: String, message: String },
    /// Schedule a follow-up reminder.
    Schedule {
        phone: String,
        owner: String,
        message: String,
        #[arg(long, default_value_t = 60)]
        delay_minutes: u32,
        #[arg(long, default_value = "custom")]
        followup_type: String,
    },
    /// Cancel a pending or queued follow-up.
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(anyhow::anyhow!("failed to load .env: {e}"));
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config_path).await,
        Command::Doctor => server::doctor(config_path).await,
        Command::Send { phone, message } => {
            server::send_one_shot(config_path, &phone, &message).await
        }
        Command::Schedule {
            phone,
            owner,
            message,
            delay_minutes,
            followup_type,
        } => {
            server::schedule_one_shot(
                config_path,
                followup::ScheduleRequest {
                    target_key: phone,
                    owner_key: owner,
                    message,
                    delay_minutes,
                    followup_type,
                },
            )
            .await
        }
        Command::Cancel { id } => server::cancel_one_shot(config_path, &id).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,sdr_agent=debug,sdr_app=debug,sdr_channels=debug,sdr_crm=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("SDR_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
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
                "unsupported SDR_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve_and_parses_schedule() {
        let cli = Cli::try_parse_from(["sdr-agent"]).expect("parse");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from([
            "sdr-agent",
            "--config",
            "/tmp/sdr.toml",
            "schedule",
            "5581999998888",
            "42",
            "oi!",
            "--delay-minutes",
            "240",
        ])
        .expect("parse schedule");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sdr.toml")));
        match cli.command {
            Some(Command::Schedule {
                delay_minutes,
                followup_type,
                ..
            }) => {
                assert_eq!(delay_minutes, 240);
                assert_eq!(followup_type, "custom");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_payload_to_string(&"boom"), "boom");
        assert_eq!(panic_payload_to_string(&String::from("bang")), "bang");
        assert_eq!(panic_payload_to_string(&42_u32), "non-string panic payload");
    }
}
