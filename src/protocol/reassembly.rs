//! Chunk reassembly for oversized responses
//!
//! The firmware splits a response that does not fit one notification into
//! `#<index>/<total>|<fragment>` pieces, 1-based, sent strictly in order.
//! There is no retransmission: a gap or a repeat throws the partial payload
//! away and the buffer waits for a fresh index 1.

use super::codec::CodecError;

/// Outcome of feeding one inbound text into the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A complete frame: either unchunked input or the concatenation of a finished sequence
    Whole(String),
    /// Chunk accepted, more expected
    Partial { index: u32, total: u32 },
    /// Chunk out of sequence; earlier progress was dropped
    Discarded { index: u32, total: u32 },
}

/// Parsed chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    pub total: u32,
}

/// Whether the text carries a chunk header rather than a whole frame
pub fn is_chunk(text: &str) -> bool {
    text.starts_with('#')
}

/// Split `#<index>/<total>|<fragment>` into its header and fragment
pub fn parse_chunk(text: &str) -> Result<(ChunkHeader, &str), CodecError> {
    let body = text
        .strip_prefix('#')
        .ok_or_else(|| CodecError::MalformedChunkHeader(preview(text)))?;
    let (header, fragment) = body
        .split_once('|')
        .ok_or_else(|| CodecError::MalformedChunkHeader(preview(text)))?;
    let (index, total) = header
        .split_once('/')
        .ok_or_else(|| CodecError::MalformedChunkHeader(preview(text)))?;

    let index: u32 = index
        .trim()
        .parse()
        .map_err(|_| CodecError::MalformedChunkHeader(preview(text)))?;
    let total: u32 = total
        .trim()
        .parse()
        .map_err(|_| CodecError::MalformedChunkHeader(preview(text)))?;
    if total == 0 {
        return Err(CodecError::MalformedChunkHeader(preview(text)));
    }

    Ok((ChunkHeader { index, total }, fragment))
}

fn preview(text: &str) -> String {
    text.chars().take(24).collect()
}

/// Single-writer accumulator for one chunked response
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buffer: String,
    expected: u32,
    total: u32,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sequence is in progress
    pub fn in_progress(&self) -> bool {
        self.total != 0
    }

    /// Next index the buffer will accept, 0 when idle
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Feed one inbound text (already transport-decoded)
    pub fn push(&mut self, text: &str) -> Result<Assembled, CodecError> {
        if !is_chunk(text) {
            return Ok(Assembled::Whole(text.to_string()));
        }

        let (ChunkHeader { index, total }, fragment) = parse_chunk(text)?;

        if total != self.total {
            if self.in_progress() {
                tracing::debug!(
                    "New chunk sequence ({} chunks) replaces unfinished one ({}/{})",
                    total,
                    self.expected.saturating_sub(1),
                    self.total
                );
            }
            self.restart(total);
        }

        if index == self.expected {
            self.buffer.push_str(fragment);
            self.expected += 1;
        } else {
            tracing::debug!(
                "Out of order chunk {}/{} (expected {}), discarding buffer",
                index,
                total,
                self.expected
            );
            self.restart(total);
            if index != 1 {
                return Ok(Assembled::Discarded { index, total });
            }
            self.buffer.push_str(fragment);
            self.expected = 2;
        }

        if self.expected > self.total {
            let whole = std::mem::take(&mut self.buffer);
            tracing::debug!("Chunk reassembly complete: {} chunks, {} bytes", total, whole.len());
            self.clear();
            return Ok(Assembled::Whole(whole));
        }

        if index == 1 || index % 10 == 0 {
            tracing::debug!("Chunk {}/{} buffered ({} bytes so far)", index, total, self.buffer.len());
        }
        Ok(Assembled::Partial { index, total })
    }

    /// Drop any partial sequence
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected = 0;
        self.total = 0;
    }

    fn restart(&mut self, total: u32) {
        self.buffer.clear();
        self.expected = 1;
        self.total = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(payload: &str, size: usize) -> Vec<String> {
        let pieces: Vec<String> = payload
            .as_bytes()
            .chunks(size)
            .map(|c| String::from_utf8(c.to_vec()).unwrap())
            .collect();
        let total = pieces.len();
        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| format!("#{}/{}|{}", i + 1, total, piece))
            .collect()
    }

    #[test]
    fn test_unchunked_text_passes_through() {
        let mut buffer = ReassemblyBuffer::new();
        let out = buffer.push(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(out, Assembled::Whole(r#"{"status":"ok"}"#.to_string()));
        assert!(!buffer.in_progress());
    }

    #[test]
    fn test_in_order_sequence_completes_only_on_last_chunk() {
        let payload = r#"{"status":"ok","payload":{"signature_base64":"AAECAwQFBgcICQ=="}}"#;
        let parts = chunks(payload, 7);
        let total = parts.len() as u32;
        let mut buffer = ReassemblyBuffer::new();

        for (i, part) in parts.iter().enumerate() {
            let out = buffer.push(part).unwrap();
            let index = i as u32 + 1;
            if index < total {
                assert_eq!(out, Assembled::Partial { index, total });
            } else {
                assert_eq!(out, Assembled::Whole(payload.to_string()));
            }
        }
        assert!(!buffer.in_progress());
    }

    #[test]
    fn test_out_of_order_discards_progress() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(buffer.push("#1/3|ab").unwrap(), Assembled::Partial { index: 1, total: 3 });
        assert_eq!(buffer.push("#3/3|ef").unwrap(), Assembled::Discarded { index: 3, total: 3 });

        // Chunk 2 cannot resume the dropped sequence
        assert_eq!(buffer.push("#2/3|cd").unwrap(), Assembled::Discarded { index: 2, total: 3 });

        // Only a fresh chunk 1 starts again
        assert_eq!(buffer.push("#1/3|AB").unwrap(), Assembled::Partial { index: 1, total: 3 });
        assert_eq!(buffer.push("#2/3|CD").unwrap(), Assembled::Partial { index: 2, total: 3 });
        assert_eq!(buffer.push("#3/3|EF").unwrap(), Assembled::Whole("ABCDEF".to_string()));
    }

    #[test]
    fn test_duplicate_chunk_discards_progress() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.push("#1/2|ab").unwrap();
        assert_eq!(buffer.push("#1/2|ab").unwrap(), Assembled::Partial { index: 1, total: 2 });
        assert_eq!(buffer.expected(), 2);
        assert_eq!(buffer.push("#2/2|cd").unwrap(), Assembled::Whole("abcd".to_string()));
    }

    #[test]
    fn test_total_change_starts_new_sequence() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.push("#1/4|old").unwrap();
        assert_eq!(buffer.push("#1/2|ne").unwrap(), Assembled::Partial { index: 1, total: 2 });
        assert_eq!(buffer.push("#2/2|w").unwrap(), Assembled::Whole("new".to_string()));
    }

    #[test]
    fn test_single_chunk_sequence() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(buffer.push("#1/1|{}").unwrap(), Assembled::Whole("{}".to_string()));
    }

    #[test]
    fn test_malformed_headers() {
        let mut buffer = ReassemblyBuffer::new();
        for bad in ["#1/2", "#a/2|x", "#1/0|x", "#12|x"] {
            assert!(
                matches!(buffer.push(bad), Err(CodecError::MalformedChunkHeader(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_fragment_may_contain_pipes() {
        let (header, fragment) = parse_chunk("#2/5|a|b").unwrap();
        assert_eq!(header, ChunkHeader { index: 2, total: 5 });
        assert_eq!(fragment, "a|b");
    }
}
