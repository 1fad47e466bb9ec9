//! Builds the `ProviderAdapter` the Engine drives, from `AppConfig` (§4.6,
//! §6 `active_pipeline`/`default_provider`). Only `EchoProvider` exists as a
//! concrete adapter in this workspace — real STT/LLM/TTS/monolithic
//! providers are out of scope (§1: "specified only by their wire contract
//! with the engine") — so every configured provider name currently resolves
//! to an `EchoProvider` instance; a deployment wiring a real adapter crate
//! would extend this match.

use std::sync::Arc;

use vagent_pipeline::PipelineOrchestrator;
use vagent_provider::{EchoProvider, ProviderAdapter};
use vagent_session::{AudioFormat, ProviderCapabilities};

use crate::config::AppConfig;
use crate::error::EngineError;

fn resolve_named_adapter(_name: &str) -> Arc<dyn ProviderAdapter> {
    EchoProvider::new()
}

/// Declared negotiable capabilities for the configured provider (§3). Every
/// adapter in this workspace is `EchoProvider`-backed, so this is the one
/// fixed capability set every deployment negotiates against; a real adapter
/// would report its own.
pub fn declared_capabilities() -> ProviderCapabilities {
    ProviderCapabilities {
        supported_input_formats: vec![AudioFormat::Pcm16],
        supported_output_formats: vec![AudioFormat::Pcm16],
        supported_sample_rates: vec![8_000, 16_000, 24_000],
        preferred_chunk_ms: 20,
        server_side_turn_detection: true,
        can_negotiate: false,
        is_monolithic: true,
    }
}

/// Build the single top-level adapter the Engine opens per call: either the
/// configured monolithic provider, or a `PipelineOrchestrator` composed from
/// the three legs of `active_pipeline`.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn ProviderAdapter>, EngineError> {
    if let Some(pipeline) = &config.active_pipeline {
        let stt = resolve_named_adapter(&pipeline.stt);
        let llm = resolve_named_adapter(&pipeline.llm);
        let tts = resolve_named_adapter(&pipeline.tts);
        return Ok(PipelineOrchestrator::new(stt, llm, tts));
    }
    if config.default_provider.is_empty() {
        return Err(EngineError::Config("no provider configured".to_string()));
    }
    Ok(resolve_named_adapter(&config.default_provider))
}
