//! Utterance accumulation.
//!
//! Owned exclusively by the session's inbound handler; DTX markers never
//! reach it (the decoder filters them, and `append` takes PCM bytes only).

/// Append-only PCM store for the utterance in progress.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
}

impl UtteranceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, pcm: Vec<u8>) {
        if pcm.is_empty() {
            return;
        }
        self.total_bytes += pcm.len();
        self.chunks.push(pcm);
    }

    pub fn size_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Atomically take the accumulated audio, leaving the buffer empty.
    pub fn flush(&mut self) -> Vec<u8> {
        let chunks = std::mem::take(&mut self.chunks);
        self.total_bytes = 0;

        let mut pcm = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
        for chunk in chunks {
            pcm.extend_from_slice(&chunk);
        }
        pcm
    }

    /// Discard everything without producing an utterance.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_size() {
        let mut buf = UtteranceBuffer::new();
        assert!(buf.is_empty());
        buf.append(vec![1, 2, 3]);
        buf.append(vec![4, 5]);
        buf.append(Vec::new()); // no-op
        assert_eq!(buf.size_bytes(), 5);
    }

    #[test]
    fn test_flush_is_atomic() {
        let mut buf = UtteranceBuffer::new();
        buf.append(vec![1, 2]);
        buf.append(vec![3]);

        let pcm = buf.flush();
        assert_eq!(pcm, vec![1, 2, 3]);
        assert!(buf.is_empty());

        // appends after flush never observe the prior contents
        buf.append(vec![9]);
        assert_eq!(buf.flush(), vec![9]);
    }

    #[test]
    fn test_clear() {
        let mut buf = UtteranceBuffer::new();
        buf.append(vec![1, 2, 3]);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.flush().is_empty());
    }
}
