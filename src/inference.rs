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

use anyhow::Result;
use std::sync::Arc;

use crate::messages::SAMPLE_RATE;

/// Parameters forwarded to the acoustic model per invocation.
#[derive(Debug, Clone, Default)]
pub struct InferenceParams {
    /// 2-char language code, or `None` for auto-detection.
    pub language: Option<String>,
}

/// One decoded segment with its visible token strings.
#[derive(Debug, Clone)]
pub struct SegmentText {
    pub text: String,
    pub tokens: Vec<String>,
}

/// Output of one model invocation.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub segments: Vec<SegmentText>,
}

impl EngineOutput {
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn tokens(&self) -> Vec<String> {
        self.segments.iter().flat_map(|s| s.tokens.clone()).collect()
    }
}

/// The external inference primitive, reduced to its contract: load once,
/// transcribe float PCM, report a variant name. Implementations are
/// entered from exactly one worker at a time.
pub trait SpeechEngine: Send {
    fn model_variant(&self) -> &str;

    fn transcribe(&mut self, samples: &[f32], params: &InferenceParams) -> Result<EngineOutput>;
}

/// Run one second of silence through the engine so first-call allocation
/// latency is paid at startup, not on the first utterance.
pub fn warm_up(engine: &mut dyn SpeechEngine) -> Result<std::time::Duration> {
    let silence = vec![0.0f32; SAMPLE_RATE as usize];
    let started = std::time::Instant::now();
    engine.transcribe(&silence, &InferenceParams::default())?;
    Ok(started.elapsed())
}

#[cfg(feature = "whisper")]
pub use whisper_engine::WhisperEngine;

#[cfg(feature = "whisper")]
mod whisper_engine {
    use super::*;
    use anyhow::Context;
    use std::path::Path;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Quantized Whisper model wrapped behind [`SpeechEngine`].
    pub struct WhisperEngine {
        ctx: WhisperContext,
        variant: String,
    }

    impl WhisperEngine {
        pub fn load(model_path: &Path, use_gpu: bool) -> Result<Self> {
            let mut params = WhisperContextParameters::default();
            params.use_gpu(use_gpu);
            let ctx = WhisperContext::new_with_params(
                model_path
                    .to_str()
                    .context("model path is not valid UTF-8")?,
                params,
            )
            .with_context(|| format!("Failed to load whisper model {}", model_path.display()))?;

            let variant = model_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "whisper".to_string());

            Ok(Self { ctx, variant })
        }
    }

    impl SpeechEngine for WhisperEngine {
        fn model_variant(&self) -> &str {
            &self.variant
        }

        fn transcribe(&mut self, samples: &[f32], params: &InferenceParams) -> Result<EngineOutput> {
            let mut full = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            if let Some(ref lang) = params.language {
                full.set_language(Some(lang.as_str()));
            }
            full.set_translate(false);
            full.set_print_special(false);
            full.set_print_progress(false);
            full.set_print_realtime(false);
            full.set_print_timestamps(false);

            let mut state = self
                .ctx
                .create_state()
                .context("Failed to create whisper state")?;
            state
                .full(full, samples)
                .context("Whisper inference failed")?;

            let n_segments = state
                .full_n_segments()
                .context("Failed to read segment count")?;
            let mut segments = Vec::with_capacity(n_segments as usize);
            for i in 0..n_segments {
                let text = state
                    .full_get_segment_text(i)
                    .context("Failed to read segment text")?;
                let n_tokens = state
                    .full_n_tokens(i)
                    .context("Failed to read token count")?;
                let mut tokens = Vec::with_capacity(n_tokens as usize);
                for j in 0..n_tokens {
                    let token = state
                        .full_get_token_text(i, j)
                        .context("Failed to read token text")?;
                    // Special markers like [_BEG_] are model bookkeeping,
                    // not transcript content.
                    if token.starts_with('[') && token.ends_with(']') {
                        continue;
                    }
                    tokens.push(token);
                }
                segments.push(SegmentText { text, tokens });
            }
            Ok(EngineOutput { segments })
        }
    }
}

/// Deterministic engine for tests and for running the consumer without a
/// model build. Emits a scripted word per invocation and records the
/// sample count of every call.
pub struct ScriptedEngine {
    script: Vec<String>,
    call: usize,
    calls: Arc<parking_lot::Mutex<Vec<usize>>>,
    fail_on_call: Option<usize>,
}

impl ScriptedEngine {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: script.into_iter().map(Into::into).collect(),
            call: 0,
            calls: Arc::new(parking_lot::Mutex::new(Vec::new())),
            fail_on_call: None,
        }
    }

    /// Handle for inspecting the sample counts the engine was fed, in
    /// invocation order.
    pub fn call_log(&self) -> Arc<parking_lot::Mutex<Vec<usize>>> {
        self.calls.clone()
    }

    /// Make the n-th invocation (0-based) return an error.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

impl SpeechEngine for ScriptedEngine {
    fn model_variant(&self) -> &str {
        "scripted"
    }

    fn transcribe(&mut self, samples: &[f32], _params: &InferenceParams) -> Result<EngineOutput> {
        let index = self.call;
        self.call += 1;
        self.calls.lock().push(samples.len());
        if self.fail_on_call == Some(index) {
            anyhow::bail!("scripted failure on call {index}");
        }
        let word = self
            .script
            .get(index % self.script.len().max(1))
            .cloned()
            .unwrap_or_else(|| format!("word{index}"));
        Ok(EngineOutput {
            segments: vec![SegmentText {
                text: word.clone(),
                tokens: vec![word],
            }],
        })
    }
}
