//! Process entry point: load configuration, install logging, construct the
//! process-wide singletons (§5) and `Engine`, then run until a shutdown
//! signal drains active calls (§5 `shutdownDrainMs`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vagent_ari::{AriClient, AriConfig};
use vagent_audiosocket::{AudioSocketConfig, AudioSocketServer};
use vagent_engine::config::{AudioTransport, DownstreamMode as ConfigDownstreamMode};
use vagent_engine::engine::spawn_media_servers;
use vagent_engine::providers::build_provider;
use vagent_engine::{AppConfig, Engine};
use vagent_gating::GatingCoordinator;
use vagent_infra::{setup_logging, LoggingConfig, MetricsCollector};
use vagent_playback::{PlaybackManager, PlaybackManagerConfig};
use vagent_rtp::{RtpServer, RtpServerConfig};
use vagent_session::SessionStore;

/// Bridges an Asterisk-style PBX to pluggable STT/LLM/TTS or monolithic
/// voice providers over a per-call conversation state machine.
#[derive(Debug, Parser)]
#[command(name = "vagent-engine", version, about)]
struct Cli {
    /// Path to a TOML config file (optional; falls back to built-in
    /// defaults plus `VAGENT_`-prefixed environment variables).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `RUST_LOG`-style filtering when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long)]
    log_json: bool,

    /// Port for `GET /healthz`. Overrides the config file's
    /// `observability.health_port` when set.
    #[arg(long)]
    health_port: Option<u16>,

    /// Port for `GET /metrics`. Overrides the config file's
    /// `observability.metrics_port` when set.
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(
        LoggingConfig::new(vagent_infra::logging::parse_level(&cli.log_level)).with_json(cli.log_json),
    );

    let mut config = AppConfig::load(cli.config.as_ref().and_then(|p| p.to_str()))?;
    if let Some(port) = cli.health_port {
        config.observability.health_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.observability.metrics_port = port;
    }
    info!(
        asterisk_host = %config.asterisk.host,
        audio_transport = ?config.transport.audio_transport,
        downstream_mode = ?config.transport.downstream_mode,
        "starting vagent-engine"
    );

    let metrics = MetricsCollector::new();
    let store = SessionStore::new();
    let gating = Arc::new(GatingCoordinator::new());

    let ari = Arc::new(AriClient::new(AriConfig {
        base_url: config.asterisk.ari_base_url.clone(),
        ws_url: config.asterisk.ari_ws_url.clone(),
        username: config.asterisk.ari_username.clone(),
        password: config.asterisk.ari_password.clone(),
        app: config.asterisk.app.clone(),
    }));

    let rtp = RtpServer::new(RtpServerConfig {
        bind_host: config.transport.rtp_bind_host.clone(),
        port_range: (config.transport.rtp_port_range_start, config.transport.rtp_port_range_end),
        ..RtpServerConfig::default()
    });

    let audiosocket = AudioSocketServer::new(AudioSocketConfig {
        bind_addr: config.transport.audiosocket_bind_addr.clone(),
        egress_stall_timeout: Duration::from_millis(config.transport.egress_stall_timeout_ms),
        ..AudioSocketConfig::default()
    });

    let playback = PlaybackManager::new(
        store.clone(),
        gating.clone(),
        ari.clone(),
        audiosocket.clone(),
        PlaybackManagerConfig {
            media_dir: PathBuf::from(&config.playback.media_dir),
            watchdog: Duration::from_millis(config.timeouts.tts_gate_watchdog_ms),
            farewell_delay: Duration::from_millis(config.timeouts.farewell_hangup_delay_ms),
        },
    );

    let provider = build_provider(&config)?;

    let shutdown_drain = config.timeouts.shutdown_drain();
    let health_port = config.observability.health_port;
    let metrics_port = config.observability.metrics_port;
    let downstream_mode_matches_transport = matches!(
        (&config.transport.audio_transport, &config.transport.downstream_mode),
        (AudioTransport::Rtp, ConfigDownstreamMode::File)
            | (AudioTransport::Audiosocket, ConfigDownstreamMode::File)
            | (AudioTransport::Audiosocket, ConfigDownstreamMode::Stream)
    );
    if !downstream_mode_matches_transport {
        warn!("stream downstream_mode requires audiosocket transport; falling back is the Engine's responsibility per utterance, not a startup failure");
    }

    let engine = Engine::new(config, store, gating, ari.clone(), rtp, audiosocket, playback, provider, metrics);

    let (ari_event_tx, ari_event_rx) = mpsc::channel(256);
    let ari_for_events = ari.clone();
    let ari_event_loop = tokio::spawn(async move { ari_for_events.run_event_loop(ari_event_tx).await });

    let dispatch_handle = tokio::spawn(engine.clone().dispatch_ari_events(ari_event_rx));
    let (rtp_handle, audiosocket_handle) = spawn_media_servers(engine.clone());

    let health_addr: SocketAddr = ([0, 0, 0, 0], health_port).into();
    let metrics_addr: SocketAddr = ([0, 0, 0, 0], metrics_port).into();
    let observability_engine = engine.clone();
    let observability_handle = tokio::spawn(async move {
        if let Err(err) = vagent_engine::observability::serve(observability_engine, health_addr, metrics_addr).await
        {
            error!(error = %err, "observability server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining active calls");
        }
        _ = ari_event_loop => {
            warn!("ARI event loop exited unexpectedly");
        }
        _ = dispatch_handle => {
            warn!("ARI event dispatcher exited unexpectedly");
        }
        _ = rtp_handle => {
            warn!("rtp server task exited unexpectedly");
        }
        _ = audiosocket_handle => {
            warn!("audiosocket server task exited unexpectedly");
        }
        _ = observability_handle => {
            warn!("observability server task exited unexpectedly");
        }
    }

    // §5: drain active calls up to `shutdownDrainMs`, then force-terminate
    // by simply exiting the process; in-flight ARI/provider work is
    // best-effort cancelled by dropping their tasks.
    let deadline = tokio::time::Instant::now() + shutdown_drain;
    while engine.active_call_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if engine.active_call_count() > 0 {
        warn!(remaining = engine.active_call_count(), "forcing shutdown with calls still active");
    }

    Ok(())
}
