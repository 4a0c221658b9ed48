//! Voice practice client.
//!
//! Plays one recorded utterance into a gateway session and prints the
//! resulting conversation. Audio files are raw PCM16, mono, 24 kHz.

mod devices;

use anyhow::{Context, bail};
use clap::Parser;
use devices::{FileMicrophone, FileSpeaker, duration_of};
use practice_core::{SessionConfig, SessionSnapshot, SessionState, VoiceSession};
use practice_protocol::{Role, pcm};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{Level, info, warn};

/// Practice a spoken exchange against a realtime voice gateway
#[derive(Parser)]
#[command(name = "practice", version, about)]
struct Cli {
    /// Gateway relay endpoint
    #[arg(long, env = "PRACTICE_GATEWAY", default_value = "ws://127.0.0.1:3000/realtime")]
    gateway: String,

    /// Utterance to send (raw PCM16 mono 24 kHz)
    #[arg(long)]
    input: PathBuf,

    /// Where to write the assistant's spoken reply
    #[arg(long)]
    output: Option<PathBuf>,

    /// Size of each streamed audio chunk, in milliseconds
    #[arg(long, default_value_t = 100)]
    chunk_ms: u64,

    /// How long to wait for the assistant to finish answering
    #[arg(long, default_value_t = 20)]
    wait_secs: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let bytes = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let samples = pcm::samples_from_le_bytes(&bytes);
    if samples.is_empty() {
        bail!("{} contains no audio", cli.input.display());
    }
    if cli.chunk_ms == 0 {
        bail!("--chunk-ms must be positive");
    }

    let microphone = Arc::new(FileMicrophone::new(samples, Duration::from_millis(cli.chunk_ms)));
    let speaker = FileSpeaker::create(cli.output.clone()).context("Failed to create reply file")?;
    info!(
        gateway = %cli.gateway,
        utterance_secs = duration_of(microphone.len()).as_secs_f32(),
        "Starting practice session"
    );

    let session = VoiceSession::spawn(
        SessionConfig::new(cli.gateway.clone()),
        microphone.clone(),
        Arc::new(speaker),
    );
    let result = converse(&session, &microphone, Duration::from_secs(cli.wait_secs)).await;

    for message in session.snapshot().messages {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S"),
            message.role,
            message.content
        );
    }
    session.shutdown().await;
    result
}

async fn converse(
    session: &VoiceSession,
    microphone: &FileMicrophone,
    wait: Duration,
) -> anyhow::Result<()> {
    session.connect().await.context("Failed to connect to the gateway")?;
    info!("Session connected");

    session.start_recording().await.context("Failed to start recording")?;
    let mut snapshots = session.subscribe();
    tokio::select! {
        () = microphone.drained() => {}
        interrupted = snapshots.wait_for(|s| s.state != SessionState::Recording) => {
            let reason = interrupted
                .ok()
                .and_then(|s| s.connection_error.clone())
                .unwrap_or_else(|| "session stopped".to_string());
            bail!("Recording was interrupted: {reason}");
        }
    }
    session.stop_recording().await.context("Failed to stop recording")?;
    info!("Utterance sent. Waiting for the reply...");

    let settled = tokio::time::timeout(wait, snapshots.wait_for(reply_settled)).await;
    let snapshot = match settled {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => bail!("Session ended unexpectedly"),
        Err(_) => {
            warn!(wait_secs = wait.as_secs(), "Timed out waiting for the reply");
            return Ok(());
        }
    };
    if snapshot.state.is_terminal() {
        bail!(
            "Session ended: {}",
            snapshot.connection_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// The assistant has answered and finished speaking, or the session died.
fn reply_settled(snapshot: &SessionSnapshot) -> bool {
    if snapshot.state.is_terminal() {
        return true;
    }
    snapshot.state == SessionState::Connected
        && snapshot
            .messages
            .iter()
            .any(|message| message.role == Role::Assistant)
}
