//! Layered `AppConfig` (§6): built-in defaults, then an optional TOML file,
//! then `VAGENT_`-prefixed environment variables (double underscore as the
//! section separator), using the `config` crate the way the teacher's
//! `infra-common` composes layered sources. Grounded structurally on
//! `call-engine::config::CallCenterConfig`: one struct per concern, explicit
//! `Default` impls, and a `validate()` pass run once at startup.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioTransport {
    Rtp,
    Audiosocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamMode {
    File,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsteriskConfig {
    pub host: String,
    pub ari_base_url: String,
    pub ari_ws_url: String,
    pub ari_username: String,
    pub ari_password: String,
    pub app: String,
}

impl Default for AsteriskConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ari_base_url: "http://127.0.0.1:8088/ari".to_string(),
            ari_ws_url: "ws://127.0.0.1:8088/ari/events".to_string(),
            ari_username: "vagent".to_string(),
            ari_password: "vagent".to_string(),
            app: "vagent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub audio_transport: AudioTransport,
    pub downstream_mode: DownstreamMode,
    pub rtp_bind_host: String,
    pub rtp_port_range_start: u16,
    pub rtp_port_range_end: u16,
    pub audiosocket_bind_addr: String,
    pub egress_stall_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            audio_transport: AudioTransport::Audiosocket,
            downstream_mode: DownstreamMode::Stream,
            rtp_bind_host: "0.0.0.0".to_string(),
            rtp_port_range_start: 16000,
            rtp_port_range_end: 16200,
            audiosocket_bind_addr: "0.0.0.0:40000".to_string(),
            egress_stall_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub aggressiveness: u8,
    pub start_frames: u32,
    pub end_frames: u32,
    pub silence_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { aggressiveness: 2, start_frames: 3, end_frames: 8, silence_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub kind: String,
    pub credentials: HashMap<String, String>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stt: String,
    pub llm: String,
    pub tts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub setup_timeout_ms: u64,
    pub dead_call_timeout_ms: u64,
    pub tts_gate_watchdog_ms: u64,
    pub farewell_hangup_delay_ms: u64,
    pub provider_request_timeout_ms: u64,
    pub shutdown_drain_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 10_000,
            dead_call_timeout_ms: 60_000,
            tts_gate_watchdog_ms: 10_000,
            farewell_hangup_delay_ms: 2_500,
            provider_request_timeout_ms: 30_000,
            shutdown_drain_ms: 15_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub media_dir: String,
    pub greeting_text: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            media_dir: "/tmp/vagent-media".to_string(),
            greeting_text: "Hello, how can I help you today?".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub health_port: u16,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { health_port: 9091, metrics_port: 9090 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub asterisk: AsteriskConfig,
    pub transport: TransportConfig,
    pub vad: VadConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub active_pipeline: Option<PipelineConfig>,
    pub default_provider: String,
    pub timeouts: TimeoutsConfig,
    pub playback: PlaybackConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load defaults, then an optional TOML file, then `VAGENT_`-prefixed
    /// env vars (`__` as the section separator, e.g. `VAGENT_ASTERISK__HOST`).
    pub fn load(config_path: Option<&str>) -> Result<Self, EngineError> {
        let defaults = AppConfig::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).map_err(|e| EngineError::Config(e.to_string()))?,
        );
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("VAGENT")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder.build().map_err(|e| EngineError::Config(e.to_string()))?;
        let app: AppConfig = raw.try_deserialize().map_err(|e| EngineError::Config(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.default_provider.is_empty() && self.active_pipeline.is_none() {
            return Err(EngineError::Config(
                "either default_provider or active_pipeline must be set".to_string(),
            ));
        }
        if self.transport.rtp_port_range_start >= self.transport.rtp_port_range_end {
            return Err(EngineError::Config("rtp port range is empty".to_string()));
        }
        Ok(())
    }
}
