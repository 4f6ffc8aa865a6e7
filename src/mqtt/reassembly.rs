//! Rebuilds publish payloads that the transport hands over in several chunks.
//!
//! Only one fragmented message can be in flight: a chunk that carries a topic
//! always starts a new message, and whatever was buffered before is dropped.
//! Chunks may arrive in any order but must not overlap, so the message is
//! complete exactly when every byte has been written once.

use super::error::SessionError;
use super::transport::DataChunk;
use tracing::{debug, warn};

/// Result of feeding one chunk
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The message is whole and ready for dispatch
    Complete { topic: String, payload: Vec<u8> },
    /// More chunks are expected
    Buffering { received: usize, total: usize },
}

#[derive(Debug)]
struct PartialMessage {
    topic: String,
    data: Vec<u8>,
    /// Byte ranges written so far, pairwise disjoint
    written: Vec<(usize, usize)>,
    received: usize,
}

impl PartialMessage {
    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.written
            .iter()
            .any(|&(from, to)| start < to && from < end)
    }
}

#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_buffering(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop a half-received message, e.g. when the connection goes away
    pub fn clear(&mut self) {
        if let Some(stale) = self.pending.take() {
            debug!(
                "Dropping incomplete message on {} ({}/{} bytes)",
                stale.topic,
                stale.received,
                stale.data.len()
            );
        }
    }

    pub fn on_chunk(&mut self, chunk: DataChunk) -> Result<ChunkOutcome, SessionError> {
        let DataChunk {
            topic,
            payload,
            offset,
            total_len,
        } = chunk;

        match topic {
            Some(topic) => self.begin(topic, payload, offset, total_len),
            None => self.append(payload, offset, total_len),
        }
    }

    fn begin(
        &mut self,
        topic: String,
        payload: Vec<u8>,
        offset: usize,
        total_len: usize,
    ) -> Result<ChunkOutcome, SessionError> {
        if let Some(stale) = self.pending.take() {
            warn!(
                "New message on {} before {} completed, discarding {}/{} bytes",
                topic,
                stale.topic,
                stale.received,
                stale.data.len()
            );
        }

        if offset == 0 && payload.len() == total_len {
            return Ok(ChunkOutcome::Complete { topic, payload });
        }
        if payload.len() > total_len {
            return Err(SessionError::MalformedFragment(format!(
                "first chunk on {} is {} bytes, message declares {}",
                topic,
                payload.len(),
                total_len
            )));
        }
        if offset != 0 {
            debug!("First chunk on {} reports offset {}, placing it at 0", topic, offset);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(total_len).map_err(|e| {
            SessionError::AllocationFailure(format!(
                "{} bytes for message on {}: {}",
                total_len, topic, e
            ))
        })?;
        data.resize(total_len, 0);
        data[..payload.len()].copy_from_slice(&payload);

        debug!(
            "Buffering fragmented message on {}: {}/{} bytes",
            topic,
            payload.len(),
            total_len
        );
        let written = if payload.is_empty() {
            Vec::new()
        } else {
            vec![(0, payload.len())]
        };
        self.pending = Some(PartialMessage {
            topic,
            data,
            written,
            received: payload.len(),
        });
        Ok(self.finish_if_complete())
    }

    fn append(
        &mut self,
        payload: Vec<u8>,
        offset: usize,
        total_len: usize,
    ) -> Result<ChunkOutcome, SessionError> {
        let Some(partial) = self.pending.as_mut() else {
            return Err(SessionError::MalformedFragment(
                "continuation chunk without an active message".into(),
            ));
        };

        let expected = partial.data.len();
        let end = offset
            .checked_add(payload.len())
            .filter(|&end| end <= expected && total_len == expected);
        let Some(end) = end else {
            let topic = partial.topic.clone();
            self.pending = None;
            return Err(SessionError::MalformedFragment(format!(
                "chunk {}+{} (total {}) does not fit message on {} of {} bytes",
                offset,
                payload.len(),
                total_len,
                topic,
                expected
            )));
        };

        if payload.is_empty() {
            return Ok(self.finish_if_complete());
        }
        if partial.overlaps(offset, end) {
            let topic = partial.topic.clone();
            self.pending = None;
            return Err(SessionError::MalformedFragment(format!(
                "chunk {}+{} overlaps data already received for {}",
                offset,
                payload.len(),
                topic
            )));
        }

        partial.data[offset..end].copy_from_slice(&payload);
        partial.written.push((offset, end));
        partial.received += payload.len();
        debug!(
            "Chunk for {}: {}/{} bytes",
            partial.topic, partial.received, expected
        );
        Ok(self.finish_if_complete())
    }

    fn finish_if_complete(&mut self) -> ChunkOutcome {
        match self.pending.take() {
            Some(partial) if partial.received == partial.data.len() => ChunkOutcome::Complete {
                topic: partial.topic,
                payload: partial.data,
            },
            Some(partial) => {
                let outcome = ChunkOutcome::Buffering {
                    received: partial.received,
                    total: partial.data.len(),
                };
                self.pending = Some(partial);
                outcome
            }
            None => ChunkOutcome::Buffering {
                received: 0,
                total: 0,
            },
        }
    }
}
