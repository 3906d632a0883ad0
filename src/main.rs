//! avatar-relayd: the parent control-plane process (§1, §4.F, §4.H).
//!
//! The HTTP front controller this would normally sit behind is out of
//! scope (§1 "Explicitly out of scope"); this binary exposes the same
//! three control-surface operations directly as CLI subcommands so the
//! engine is runnable and inspectable standalone.

use anyhow::Result;
use avatar_session_engine::{Config, ControlSurface, StartRequest};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "avatar-relayd")]
#[command(about = "Control plane for the translation-avatar session engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a translation-avatar session for one speaker.
    Start {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        speaker_uid: u32,
        #[arg(long, default_value = "en")]
        source_language: String,
        /// Comma-separated target languages.
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[arg(long)]
        avatar_id: String,
        #[arg(long, default_value_t = true)]
        avatar_mode: bool,
    },
    /// Stop a session by task id.
    Stop { task_id: String },
    /// List every live registry entry.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install Rustls crypto provider for HTTPS support
    // This is required for Rustls 0.23+
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install Rustls crypto provider");

    // Initialize logging (WARN level by default, use RUST_LOG=info for debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let surface = ControlSurface::new(Config::from_env());

    match cli.command {
        Commands::Start {
            channel,
            speaker_uid,
            source_language,
            targets,
            avatar_id,
            avatar_mode,
        } => {
            let response = surface
                .start(StartRequest {
                    channel,
                    speaker_uid,
                    source_language,
                    targets,
                    avatar_id,
                    avatar_mode,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Stop { task_id } => {
            surface.stop(&task_id).await?;
            println!("stopped {task_id}");
        }
        Commands::List => {
            let snapshot = surface.list().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
