/*
 * Whisper Bridge - Rust Edition
 * Copyright (c) 2025 Whisper Bridge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{AudioFormat, ControlKind, ErrorKind, PunctuationMode};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const MAX_CHUNK_SECS: f64 = 10.0;
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 300;
pub const SIZE_TOLERANCE: f64 = 0.10;

pub const CONTROL_FILE: &str = "control_signal.json";
pub const STATUS_FILE: &str = "status.json";
pub const ERROR_FILE: &str = "error.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const FINAL_FILE: &str = "latest_transcription.json";
pub const PARTIAL_PREFIX: &str = "token_update_";
pub const CHUNK_PREFIX: &str = "chunk_";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("decoding failed: {0}")]
    Decoding(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Canonical JSON encoding for every rendezvous record.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|e| CodecError::Encoding(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(e.to_string()))
}

pub fn chunk_pcm_name(session_id: &str, chunk_id: u64) -> String {
    format!("{CHUNK_PREFIX}{session_id}_{chunk_id}.pcm")
}

pub fn chunk_meta_name(session_id: &str, chunk_id: u64) -> String {
    format!("{CHUNK_PREFIX}{session_id}_{chunk_id}.json")
}

pub fn partial_name(timestamp: DateTime<Utc>) -> String {
    format!("{PARTIAL_PREFIX}{}.json", timestamp.timestamp_millis())
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > 100 {
        return Err(CodecError::Validation(format!(
            "session id length {} outside 1..=100",
            session_id.len()
        )));
    }
    Ok(())
}

fn validate_drift(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let drift = (now - timestamp).num_seconds().abs();
    if drift > MAX_TIMESTAMP_DRIFT_SECS {
        return Err(CodecError::Validation(format!(
            "timestamp drift {drift}s exceeds {MAX_TIMESTAMP_DRIFT_SECS}s"
        )));
    }
    Ok(())
}

/// Metadata published beside every PCM chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub session_id: String,
    pub chunk_id: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: AudioFormat,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub is_last_chunk: bool,
    pub pcm_filename: String,
}

impl ChunkMetadata {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        validate_session_id(&self.session_id)?;
        if self.sample_rate != SAMPLE_RATE {
            return Err(CodecError::Validation(format!(
                "sample rate {} != {SAMPLE_RATE}",
                self.sample_rate
            )));
        }
        if self.channels != CHANNELS {
            return Err(CodecError::Validation(format!(
                "channel count {} != {CHANNELS}",
                self.channels
            )));
        }
        if !(self.duration_secs > 0.0 && self.duration_secs <= MAX_CHUNK_SECS) {
            return Err(CodecError::Validation(format!(
                "duration {}s outside (0, {MAX_CHUNK_SECS}]",
                self.duration_secs
            )));
        }
        validate_drift(self.timestamp, now)?;
        Ok(())
    }

    /// Byte length the PCM sibling should have for the declared duration.
    pub fn expected_byte_len(&self) -> f64 {
        self.duration_secs
            * self.sample_rate as f64
            * self.format.bytes_per_sample() as f64
            * self.channels as f64
    }

    /// Check the actual PCM length against the declared one, within
    /// the 10% tolerance.
    pub fn check_pcm_len(&self, actual: usize) -> Result<()> {
        let expected = self.expected_byte_len();
        let deviation = (actual as f64 - expected).abs();
        if deviation > expected * SIZE_TOLERANCE {
            return Err(CodecError::Validation(format!(
                "pcm size {actual} deviates more than 10% from expected {expected:.0}"
            )));
        }
        Ok(())
    }
}

/// Control record at `control/control_signal.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub signal: ControlKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ControlSignal {
    pub fn new(signal: ControlKind, session_id: impl Into<String>) -> Self {
        Self {
            signal,
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_session_id(&self.session_id)
    }
}

/// Fire-and-forget partial transcript at `transcripts/token_update_<ms>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialTranscript {
    pub session_id: String,
    pub text: String,
    pub tokens: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PartialTranscript {
    pub fn validate(&self) -> Result<()> {
        validate_session_id(&self.session_id)
    }
}

/// Authoritative transcript at `transcripts/latest_transcription.json`,
/// overwritten in place once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalTranscript {
    pub session_id: String,
    pub text: String,
    pub is_final: bool,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl FinalTranscript {
    pub fn validate(&self) -> Result<()> {
        validate_session_id(&self.session_id)?;
        if !self.is_final {
            return Err(CodecError::Validation(
                "final transcript without is_final flag".to_string(),
            ));
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(CodecError::Validation(format!(
                    "confidence {c} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Error record at `control/error.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, description: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            session_id,
            is_recoverable: kind.is_recoverable(),
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref sid) = self.session_id {
            validate_session_id(sid)?;
        }
        Ok(())
    }
}

/// Consumer health record at `control/status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub model_loaded: bool,
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session: Option<String>,
    pub model_variant: String,
    pub memory_mb: u64,
    pub dropped_chunks: u64,
    pub last_update: DateTime<Utc>,
}

impl StatusRecord {
    pub fn validate(&self) -> Result<()> {
        if let Some(ref sid) = self.current_session {
            validate_session_id(sid)?;
        }
        Ok(())
    }

    /// Producers treat a record older than a few seconds as a dead consumer.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        (now - self.last_update).num_seconds() <= max_age_secs
    }
}

/// Producer-writable, consumer-readable session settings at
/// `settings/settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub punctuation: PunctuationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub vad_enabled: bool,
    pub vad_threshold: f32,
    pub streaming_enabled: bool,
    pub chunk_size_ms: u64,
    pub max_session_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            punctuation: PunctuationMode::Auto,
            language: None,
            vad_enabled: false,
            vad_threshold: 0.5,
            streaming_enabled: true,
            chunk_size_ms: 200,
            max_session_secs: 60,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(ref lang) = self.language {
            if lang.len() != 2 {
                return Err(CodecError::Validation(format!(
                    "language code '{lang}' is not a 2-char code"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(CodecError::Validation(format!(
                "vad threshold {} outside [0, 1]",
                self.vad_threshold
            )));
        }
        if !(50..=1000).contains(&self.chunk_size_ms) {
            return Err(CodecError::Validation(format!(
                "chunk size {}ms outside 50..=1000",
                self.chunk_size_ms
            )));
        }
        if !(1..=300).contains(&self.max_session_secs) {
            return Err(CodecError::Validation(format!(
                "max session duration {}s outside 1..=300",
                self.max_session_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ChunkMetadata {
        ChunkMetadata {
            session_id: "s-1".to_string(),
            chunk_id: 0,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            format: AudioFormat::Pcm16,
            duration_secs: 0.8,
            timestamp: Utc::now(),
            is_last_chunk: false,
            pcm_filename: chunk_pcm_name("s-1", 0),
        }
    }

    #[test]
    fn chunk_metadata_round_trips() {
        let meta = sample_meta();
        let decoded: ChunkMetadata = decode(&encode(&meta).unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn control_signal_round_trips() {
        let sig = ControlSignal::new(ControlKind::Start, "s-1");
        let decoded: ControlSignal = decode(&encode(&sig).unwrap()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn final_transcript_round_trips() {
        let rec = FinalTranscript {
            session_id: "s-1".to_string(),
            text: "hello world".to_string(),
            is_final: true,
            processing_time_ms: 412,
            confidence: Some(0.93),
            timestamp: Utc::now(),
        };
        let decoded: FinalTranscript = decode(&encode(&rec).unwrap()).unwrap();
        assert_eq!(decoded, rec);
        rec.validate().unwrap();
    }

    #[test]
    fn settings_round_trip_and_defaults_validate() {
        let settings = SessionSettings::default();
        settings.validate().unwrap();
        let decoded: SessionSettings = decode(&encode(&settings).unwrap()).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn decode_garbage_fails() {
        let err = decode::<ControlSignal>(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Decoding(_)));
    }

    #[test]
    fn duration_bounds_are_enforced() {
        let now = Utc::now();
        let mut meta = sample_meta();
        meta.duration_secs = 0.0;
        assert!(meta.validate(now).is_err());
        meta.duration_secs = 10.5;
        assert!(meta.validate(now).is_err());
        meta.duration_secs = 10.0;
        meta.validate(now).unwrap();
    }

    #[test]
    fn sample_rate_and_channels_are_enforced() {
        let now = Utc::now();
        let mut meta = sample_meta();
        meta.sample_rate = 44_100;
        assert!(meta.validate(now).is_err());
        let mut meta = sample_meta();
        meta.channels = 2;
        assert!(meta.validate(now).is_err());
    }

    #[test]
    fn session_id_length_is_enforced() {
        let now = Utc::now();
        let mut meta = sample_meta();
        meta.session_id = String::new();
        assert!(meta.validate(now).is_err());
        meta.session_id = "x".repeat(101);
        assert!(meta.validate(now).is_err());
        meta.session_id = "x".repeat(100);
        meta.validate(now).unwrap();
    }

    #[test]
    fn timestamp_drift_is_enforced() {
        let now = Utc::now();
        let mut meta = sample_meta();
        meta.timestamp = now - chrono::Duration::seconds(301);
        assert!(meta.validate(now).is_err());
        meta.timestamp = now + chrono::Duration::seconds(301);
        assert!(meta.validate(now).is_err());
        meta.timestamp = now - chrono::Duration::seconds(299);
        meta.validate(now).unwrap();
    }

    #[test]
    fn pcm_size_tolerance_is_ten_percent() {
        let meta = sample_meta();
        // 0.8s * 16000 * 2 bytes = 25600
        meta.check_pcm_len(25_600).unwrap();
        meta.check_pcm_len(25_600 + 2_000).unwrap();
        assert!(meta.check_pcm_len(25_600 + 3_000).is_err());
        assert!(meta.check_pcm_len(20_000).is_err());
    }

    #[test]
    fn confidence_outside_unit_interval_rejected() {
        let rec = FinalTranscript {
            session_id: "s".into(),
            text: String::new(),
            is_final: true,
            processing_time_ms: 0,
            confidence: Some(1.2),
            timestamp: Utc::now(),
        };
        assert!(rec.validate().is_err());
    }

    #[test]
    fn settings_bounds_are_enforced() {
        let mut s = SessionSettings::default();
        s.chunk_size_ms = 40;
        assert!(s.validate().is_err());
        s.chunk_size_ms = 1_001;
        assert!(s.validate().is_err());
        let mut s = SessionSettings::default();
        s.max_session_secs = 0;
        assert!(s.validate().is_err());
        s.max_session_secs = 301;
        assert!(s.validate().is_err());
        let mut s = SessionSettings::default();
        s.language = Some("eng".to_string());
        assert!(s.validate().is_err());
        s.language = Some("en".to_string());
        s.validate().unwrap();
        let mut s = SessionSettings::default();
        s.vad_threshold = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn chunk_names_pair_up() {
        assert_eq!(chunk_pcm_name("abc", 7), "chunk_abc_7.pcm");
        assert_eq!(chunk_meta_name("abc", 7), "chunk_abc_7.json");
    }
}
