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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format of the PCM payload inside an audio chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// Signed 16-bit little-endian samples.
    Pcm16,
    /// 32-bit native-endian floats in [-1, 1].
    F32,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::F32 => 4,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFormat::Pcm16 => write!(f, "pcm16"),
            AudioFormat::F32 => write!(f, "f32"),
        }
    }
}

/// Control verbs the producer publishes through the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Start,
    Stop,
    Cancel,
    Ping,
    Reset,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKind::Start => write!(f, "start"),
            ControlKind::Stop => write!(f, "stop"),
            ControlKind::Cancel => write!(f, "cancel"),
            ControlKind::Ping => write!(f, "ping"),
            ControlKind::Reset => write!(f, "reset"),
        }
    }
}

/// Session-level error taxonomy shared between the two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ModelLoadFailed,
    AudioProcessingFailed,
    InferenceFailed,
    MemoryPressure,
    InvalidAudioFormat,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Only model load failures and memory pressure end the session for good.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::ModelLoadFailed | ErrorKind::MemoryPressure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ModelLoadFailed => write!(f, "model-load-failed"),
            ErrorKind::AudioProcessingFailed => write!(f, "audio-processing-failed"),
            ErrorKind::InferenceFailed => write!(f, "inference-failed"),
            ErrorKind::MemoryPressure => write!(f, "memory-pressure"),
            ErrorKind::InvalidAudioFormat => write!(f, "invalid-audio-format"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Punctuation post-processing applied to partial and final transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunctuationMode {
    #[default]
    Auto,
    None,
    Sentence,
}

impl fmt::Display for PunctuationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PunctuationMode::Auto => write!(f, "auto"),
            PunctuationMode::None => write!(f, "none"),
            PunctuationMode::Sentence => write!(f, "sentence"),
        }
    }
}

/// Producer-side session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Recording,
    AwaitingFinal,
    Failed,
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerState::Idle => write!(f, "idle"),
            ProducerState::Recording => write!(f, "recording"),
            ProducerState::AwaitingFinal => write!(f, "awaiting_final"),
            ProducerState::Failed => write!(f, "failed"),
        }
    }
}

/// Events the producer surfaces to its UI lane.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Partial { text: String },
    Final { text: String, processing_time_ms: u64 },
    Error { kind: ErrorKind, description: String },
    TimedOut,
}
