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

use std::collections::BTreeMap;

use crate::messages::ChunkMetadata;

/// How many out-of-order chunks may wait for their predecessors.
pub const SEQUENCER_CAPACITY: usize = 10;

/// A validated chunk with its PCM payload, as handed to the sequencer.
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub meta: ChunkMetadata,
    pub pcm: Vec<u8>,
}

/// What became of one offered chunk.
#[derive(Debug, Default)]
pub struct AcceptResult {
    /// Chunks now deliverable in contiguous ascending order.
    pub deliver: Vec<BufferedChunk>,
    /// Chunk evicted to keep the buffer bounded; its files must be
    /// removed by the caller.
    pub evicted: Option<BufferedChunk>,
    /// The offered chunk was at or below the processed watermark.
    pub duplicate: bool,
}

/// Bounded reorder buffer: releases the contiguous chunk-id prefix and
/// holds gaps until they fill, dropping the oldest buffered chunk on
/// overflow.
#[derive(Debug)]
pub struct ChunkSequencer {
    buffer: BTreeMap<u64, BufferedChunk>,
    last_processed: i64,
    dropped: u64,
}

impl ChunkSequencer {
    pub fn new() -> Self {
        Self {
            buffer: BTreeMap::new(),
            last_processed: -1,
            dropped: 0,
        }
    }

    pub fn last_processed(&self) -> i64 {
        self.last_processed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn contains(&self, chunk_id: u64) -> bool {
        self.buffer.contains_key(&chunk_id)
    }

    /// Forget everything buffered, returning the entries so the caller
    /// can delete their files. The watermark resets for a new session.
    pub fn reset(&mut self) -> Vec<BufferedChunk> {
        self.last_processed = -1;
        let drained: Vec<BufferedChunk> = std::mem::take(&mut self.buffer).into_values().collect();
        drained
    }

    /// Offer one chunk. Contiguous chunks come back in `deliver`,
    /// including any buffered successors they unblock.
    pub fn accept(&mut self, chunk: BufferedChunk) -> AcceptResult {
        let mut result = AcceptResult::default();
        let id = chunk.meta.chunk_id as i64;

        if id <= self.last_processed {
            result.duplicate = true;
            return result;
        }

        if id == self.last_processed + 1 {
            self.last_processed = id;
            result.deliver.push(chunk);
            // Drain the prefix that just became contiguous.
            while let Some(entry) = self.buffer.remove(&((self.last_processed + 1) as u64)) {
                self.last_processed += 1;
                result.deliver.push(entry);
            }
            return result;
        }

        // Gap: hold the chunk until its predecessors show up.
        self.buffer.insert(chunk.meta.chunk_id, chunk);
        if self.buffer.len() > SEQUENCER_CAPACITY {
            if let Some(oldest) = self.buffer.keys().next().copied() {
                result.evicted = self.buffer.remove(&oldest);
                self.dropped += 1;
            }
        }
        result
    }
}

impl Default for ChunkSequencer {
    fn default() -> Self {
        Self::new()
    }
}
