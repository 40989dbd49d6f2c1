//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Reassembly of chunked command responses.
//!
//! Buffers are keyed by the source the chunks arrive from, not by vehicle:
//! the vehicle is resolved only once the body is complete. A response is
//! complete when every index in `0..total_chunks` has arrived. Chunks may
//! arrive out of order and exact duplicates are ignored.
//!
//! Memory is bounded in three places. Buffers older than the configured
//! timeout are evicted on every insert. Once `max_buffers` sources are open
//! the oldest buffer makes room for a new one. Inflation stops after
//! `max_body_bytes`.
//!
//! Not thread-safe; the driver keeps the assembler behind a mutex.

use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use flock_common::config::ReassemblyConfig;
use flock_msg::{CommandResponseChunk, Source};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("response chunk from {origin} declares zero chunks")]
    EmptyResponse { origin: Source },
    #[error("chunk {index} out of range for {total}-chunk response from {origin}")]
    ChunkOutOfRange { origin: Source, index: u8, total: u8 },
    #[error("failed to inflate compressed response from {origin}: {reason}")]
    Decompression { origin: Source, reason: String },
    #[error("response from {origin} exceeds {limit} bytes once inflated")]
    BodyTooLarge { origin: Source, limit: usize },
}

/// A fully reassembled response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledBody {
    pub source: Source,
    pub body: Vec<u8>,
}

impl AssembledBody {
    /// Decode the body as UTF-8, replacing invalid sequences.
    pub fn decode_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
struct AssemblyBuffer {
    sequence_id: u8,
    compressed: bool,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Instant,
}

impl AssemblyBuffer {
    fn new(sequence_id: u8, total_chunks: u8, compressed: bool, now: Instant) -> Self {
        Self {
            sequence_id,
            compressed,
            chunks: vec![None; usize::from(total_chunks)],
            received: 0,
            first_seen: now,
        }
    }

    fn matches(&self, chunk: &CommandResponseChunk, compressed: bool) -> bool {
        self.sequence_id == chunk.sequence_id
            && self.chunks.len() == usize::from(chunk.total_chunks)
            && self.compressed == compressed
    }

    /// Returns `false` for a duplicate chunk.
    fn insert(&mut self, index: u8, body: &[u8]) -> bool {
        let slot = &mut self.chunks[usize::from(index)];
        if slot.is_some() {
            return false;
        }
        *slot = Some(body.to_vec());
        self.received += 1;
        true
    }

    fn is_complete(&self) -> bool {
        self.received == self.chunks.len()
    }

    fn concat(self) -> Vec<u8> {
        self.chunks.into_iter().flatten().flatten().collect()
    }
}

/// Accumulates response chunks per source until a body is complete.
#[derive(Debug)]
pub struct ChunkAssembler {
    timeout: Duration,
    max_buffers: usize,
    max_body_bytes: usize,
    buffers: HashMap<Source, AssemblyBuffer>,
}

impl ChunkAssembler {
    pub fn new(timeout: Duration, max_buffers: usize) -> Self {
        Self {
            timeout,
            max_buffers: max_buffers.max(1),
            max_body_bytes: ReassemblyConfig::default().max_body_bytes,
            buffers: HashMap::new(),
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit.max(1);
        self
    }

    pub fn from_config(config: &ReassemblyConfig) -> Self {
        Self::new(config.chunk_timeout, config.max_pending_buffers)
            .with_max_body_bytes(config.max_body_bytes)
    }

    /// Add a chunk; returns the body once the last missing chunk arrived.
    pub fn add_chunk(
        &mut self,
        chunk: &CommandResponseChunk,
        source: &Source,
        compressed: bool,
    ) -> Result<Option<AssembledBody>, ReassemblyError> {
        self.add_chunk_at(chunk, source, compressed, Instant::now())
    }

    fn add_chunk_at(
        &mut self,
        chunk: &CommandResponseChunk,
        source: &Source,
        compressed: bool,
        now: Instant,
    ) -> Result<Option<AssembledBody>, ReassemblyError> {
        self.evict_expired(now);

        if chunk.total_chunks == 0 {
            return Err(ReassemblyError::EmptyResponse {
                origin: source.clone(),
            });
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(ReassemblyError::ChunkOutOfRange {
                origin: source.clone(),
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }

        let stale = self
            .buffers
            .get(source)
            .is_some_and(|buffer| !buffer.matches(chunk, compressed));
        if stale {
            warn!(source = %source, sequence_id = chunk.sequence_id, "discarding incomplete response superseded by a new one");
            self.buffers.remove(source);
        }

        if !self.buffers.contains_key(source) && self.buffers.len() >= self.max_buffers {
            self.evict_oldest();
        }

        let buffer = self.buffers.entry(source.clone()).or_insert_with(|| {
            AssemblyBuffer::new(chunk.sequence_id, chunk.total_chunks, compressed, now)
        });
        if !buffer.insert(chunk.chunk_index, &chunk.body) {
            debug!(source = %source, index = chunk.chunk_index, "duplicate response chunk ignored");
            return Ok(None);
        }
        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(source) else {
            return Ok(None);
        };
        let mut body = buffer.concat();
        if compressed {
            body = inflate(&body, self.max_body_bytes).map_err(|err| ReassemblyError::Decompression {
                origin: source.clone(),
                reason: err.to_string(),
            })?;
        }
        if body.len() > self.max_body_bytes {
            warn!(source = %source, limit = self.max_body_bytes, "oversized response discarded");
            return Err(ReassemblyError::BodyTooLarge {
                origin: source.clone(),
                limit: self.max_body_bytes,
            });
        }
        debug!(source = %source, bytes = body.len(), compressed, "response reassembled");
        Ok(Some(AssembledBody {
            source: source.clone(),
            body,
        }))
    }

    /// Drop buffers that have waited longer than the timeout.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.buffers.len();
        self.buffers.retain(|source, buffer| {
            let keep = now.saturating_duration_since(buffer.first_seen) < timeout;
            if !keep {
                warn!(source = %source, received = buffer.received, total = buffer.chunks.len(), "abandoned partial response evicted");
            }
            keep
        });
        before - self.buffers.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.first_seen)
            .map(|(source, _)| source.clone());
        if let Some(source) = oldest {
            warn!(source = %source, "reassembly buffer limit reached; evicting oldest partial response");
            self.buffers.remove(&source);
        }
    }

    /// Number of sources with a partial response.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

/// Inflate at most `limit + 1` bytes so an oversized body is detectable
/// without expanding all of it.
fn inflate(body: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut out = Vec::new();
    ZlibDecoder::new(body).take(cap).read_to_end(&mut out)?;
    Ok(out)
}
