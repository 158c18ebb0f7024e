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

use anyhow::{Context, Result};
use std::path::Path;

use crate::messages::SAMPLE_RATE;
use crate::types::AudioFormat;

/// One block of captured audio, ready to be published as a chunk.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub duration_secs: f64,
}

/// Source of 16 kHz mono PCM blocks. The real microphone host implements
/// this; the capture binary feeds WAV files through it.
pub trait AudioSource: Send {
    /// Next block of roughly `chunk_size_ms` audio, or `None` at end of
    /// stream.
    fn next_block(&mut self) -> Result<Option<AudioBlock>>;
}

/// Convert signed 16-bit little-endian PCM bytes to float samples.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

/// Reinterpret native-endian f32 PCM bytes as float samples.
pub fn f32_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("f32 pcm payload length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Decode a chunk payload into the float samples the model consumes.
pub fn samples_from_bytes(format: AudioFormat, bytes: &[u8]) -> Result<Vec<f32>> {
    match format {
        AudioFormat::Pcm16 => {
            if bytes.len() % 2 != 0 {
                anyhow::bail!("pcm16 payload length {} is not a multiple of 2", bytes.len());
            }
            Ok(pcm16_to_f32(bytes))
        }
        AudioFormat::F32 => f32_from_bytes(bytes),
    }
}

/// Streams a 16 kHz mono 16-bit WAV file as fixed-duration PCM blocks.
pub struct WavFileSource {
    samples: Vec<i16>,
    pos: usize,
    samples_per_block: usize,
}

impl WavFileSource {
    pub fn open(path: &Path, chunk_size_ms: u64) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
        let spec = reader.spec();
        if spec.sample_rate != SAMPLE_RATE {
            anyhow::bail!(
                "WAV file is {} Hz; the bridge requires {} Hz",
                spec.sample_rate,
                SAMPLE_RATE
            );
        }
        if spec.channels != 1 {
            anyhow::bail!("WAV file has {} channels; the bridge requires mono", spec.channels);
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            anyhow::bail!("WAV file must contain 16-bit integer samples");
        }

        let samples = reader
            .into_samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read WAV samples")?;

        let samples_per_block = (SAMPLE_RATE as u64 * chunk_size_ms / 1000).max(1) as usize;
        Ok(Self {
            samples,
            pos: 0,
            samples_per_block,
        })
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }
}

impl AudioSource for WavFileSource {
    fn next_block(&mut self) -> Result<Option<AudioBlock>> {
        if self.pos >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.pos + self.samples_per_block).min(self.samples.len());
        let block = &self.samples[self.pos..end];
        self.pos = end;

        let mut bytes = Vec::with_capacity(block.len() * 2);
        for sample in block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(Some(AudioBlock {
            bytes,
            format: AudioFormat::Pcm16,
            duration_secs: block.len() as f64 / SAMPLE_RATE as f64,
        }))
    }
}

/// A short run of silence, used to flush a session when the capture side
/// never flagged a last chunk.
pub fn silence_block(duration_secs: f64) -> AudioBlock {
    let samples = (duration_secs * SAMPLE_RATE as f64) as usize;
    AudioBlock {
        bytes: vec![0u8; samples * 2],
        format: AudioFormat::Pcm16,
        duration_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_conversion_scales_to_unit_range() {
        let bytes = [
            0x00, 0x00, // 0
            0xff, 0x7f, // i16::MAX
            0x00, 0x80, // i16::MIN
        ];
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.99997).abs() < 1e-4);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn f32_bytes_round_trip() {
        let input = [0.25f32, -0.5, 1.0];
        let bytes: Vec<u8> = input.iter().flat_map(|s| s.to_ne_bytes()).collect();
        let samples = f32_from_bytes(&bytes).unwrap();
        assert_eq!(samples, input);
    }

    #[test]
    fn ragged_payloads_are_rejected() {
        assert!(samples_from_bytes(AudioFormat::Pcm16, &[0u8; 3]).is_err());
        assert!(samples_from_bytes(AudioFormat::F32, &[0u8; 6]).is_err());
    }

    #[test]
    fn silence_block_has_expected_size() {
        let block = silence_block(0.1);
        assert_eq!(block.bytes.len(), 1600 * 2);
        assert_eq!(block.format, AudioFormat::Pcm16);
    }

    #[test]
    fn wav_source_chunks_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        // half a second of a quiet ramp
        for i in 0..8_000i32 {
            writer.write_sample((i % 256) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFileSource::open(&path, 200).unwrap();
        assert!((source.total_duration_secs() - 0.5).abs() < 1e-9);

        let mut blocks = Vec::new();
        while let Some(block) = source.next_block().unwrap() {
            blocks.push(block);
        }
        // 0.5s in 200ms blocks: 200 + 200 + 100
        assert_eq!(blocks.len(), 3);
        assert!((blocks[0].duration_secs - 0.2).abs() < 1e-9);
        assert!((blocks[2].duration_secs - 0.1).abs() < 1e-9);
        let total_bytes: usize = blocks.iter().map(|b| b.bytes.len()).sum();
        assert_eq!(total_bytes, 8_000 * 2);
    }

    #[test]
    fn wav_source_rejects_wrong_rate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();
        assert!(WavFileSource::open(&path, 200).is_err());
    }
}
