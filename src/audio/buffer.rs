//! Rolling audio buffer: a bounded history of timestamped PCM chunks the
//! orchestrator can pull a segment back out of once the VAD reports a
//! `speech_end`.

use std::collections::VecDeque;

/// Default retention window if the caller doesn't specify one.
const DEFAULT_MAX_DURATION_MS: u64 = 60_000;

/// Margin added on both sides of a requested segment, since VAD boundaries
/// land slightly inside the actual speech.
const JITTER_MARGIN_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct TimestampedChunk {
    pub samples: Vec<i16>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub chunk_count: usize,
    pub total_samples: usize,
    pub span_ms: u64,
}

pub struct RollingBuffer {
    chunks: VecDeque<TimestampedChunk>,
    max_duration_ms: u64,
}

impl RollingBuffer {
    pub fn new(max_duration_ms: u64) -> Self {
        Self {
            chunks: VecDeque::new(),
            max_duration_ms,
        }
    }

    pub fn push(&mut self, chunk: TimestampedChunk) {
        let newest_ts = chunk.timestamp_ms;
        self.chunks.push_back(chunk);

        let cutoff = newest_ts.saturating_sub(self.max_duration_ms);
        while let Some(front) = self.chunks.front() {
            if front.timestamp_ms < cutoff {
                self.chunks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Concatenate samples from chunks whose timestamp falls in
    /// `[start_ms - margin, end_ms + margin)`.
    pub fn extract_segment(&self, start_ms: u64, end_ms: u64) -> Vec<i16> {
        let lower = start_ms.saturating_sub(JITTER_MARGIN_MS);
        let upper = end_ms + JITTER_MARGIN_MS;
        let mut out = Vec::new();
        for chunk in &self.chunks {
            if chunk.timestamp_ms >= lower && chunk.timestamp_ms < upper {
                out.extend_from_slice(&chunk.samples);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn stats(&self) -> BufferStats {
        let total_samples: usize = self.chunks.iter().map(|c| c.samples.len()).sum();
        let span_ms = match (self.chunks.front(), self.chunks.back()) {
            (Some(f), Some(b)) => b.timestamp_ms.saturating_sub(f.timestamp_ms),
            _ => 0,
        };
        BufferStats {
            chunk_count: self.chunks.len(),
            total_samples,
            span_ms,
        }
    }
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DURATION_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ts: u64, n: usize) -> TimestampedChunk {
        TimestampedChunk {
            samples: vec![1; n],
            timestamp_ms: ts,
        }
    }

    #[test]
    fn prunes_chunks_older_than_window() {
        let mut buf = RollingBuffer::new(1_000);
        buf.push(chunk(0, 10));
        buf.push(chunk(500, 10));
        buf.push(chunk(2_000, 10));
        let stats = buf.stats();
        // The chunk at ts=0 falls outside [2000-1000, 2000] and is pruned;
        // ts=500 is exactly at the cutoff and survives.
        assert_eq!(stats.chunk_count, 2);
    }

    /// Extraction includes the jitter margin on both edges.
    #[test]
    fn extract_segment_includes_jitter_margin() {
        let mut buf = RollingBuffer::new(60_000);
        buf.push(chunk(0, 1));
        buf.push(chunk(950, 1)); // just inside the lower margin for start=1000
        buf.push(chunk(1_500, 1));
        buf.push(chunk(2_050, 1)); // just inside the upper margin for end=2000
        buf.push(chunk(2_200, 1)); // outside

        let segment = buf.extract_segment(1_000, 2_000);
        assert_eq!(segment.len(), 3);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buf = RollingBuffer::new(1_000);
        buf.push(chunk(0, 10));
        buf.clear();
        assert_eq!(buf.stats().chunk_count, 0);
    }
}
