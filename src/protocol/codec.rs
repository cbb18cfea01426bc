//! Incremental scanner separating control frames from payload.
//!
//! Feed raw reads via [`TokenScanner::feed`] and get back an ordered event
//! sequence. Handles frames split across reads, several frames coalesced in
//! one read, and hostile never-terminated frames (bounded lookahead).
//!
//! Scanning is byte-level throughout: payload is never decoded as text, so
//! binary data passes through unmangled.

use bytes::{Bytes, BytesMut};

use super::{ControlFrame, FRAME_END, FRAME_START};

/// Longest accepted token between the delimiters.
///
/// Real tokens (version and params frames included) stay far below this; the
/// cap bounds buffering when a peer opens a frame and never closes it. Once
/// exceeded, the opener is downgraded to payload and scanning resumes.
pub const MAX_TOKEN_LEN: usize = 512;

/// An event produced by the scanner, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete control frame, stripped from the stream.
    Control(ControlFrame),
    /// A run of opaque payload bytes, exactly as received.
    Payload(Bytes),
}

/// Incremental frame/payload scanner over an append-only byte stream.
///
/// The scanner is lazy about emitting payload: bytes that could still become
/// the start of a control frame (a trailing `_`, `__`, or an open frame under
/// the length cap) are held until the ambiguity resolves. The longest
/// possible control-frame match always wins.
#[derive(Debug, Default)]
pub struct TokenScanner {
    buf: BytesMut,
}

impl TokenScanner {
    /// Create a scanner with an empty buffer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Append a chunk and drain every event that is now unambiguous.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(start) = find(&self.buf, FRAME_START) else {
                // No opener: emit everything except a trailing partial opener.
                let hold = partial_suffix_len(&self.buf, FRAME_START);
                let emit = self.buf.len() - hold;
                if emit > 0 {
                    events.push(StreamEvent::Payload(self.buf.split_to(emit).freeze()));
                }
                break;
            };

            if start > 0 {
                events.push(StreamEvent::Payload(self.buf.split_to(start).freeze()));
            }

            // Buffer now begins with the opener.
            match find(&self.buf[FRAME_START.len()..], FRAME_END) {
                Some(token_len) if token_len <= MAX_TOKEN_LEN => {
                    let total = FRAME_START.len() + token_len + FRAME_END.len();
                    let whole = self.buf.split_to(total);
                    let token = &whole[FRAME_START.len()..FRAME_START.len() + token_len];
                    events.push(StreamEvent::Control(ControlFrame::parse(token)));
                }
                Some(_) => {
                    // Terminated but over-long: not a frame we accept. The
                    // opener becomes payload and scanning resumes after it.
                    events.push(StreamEvent::Payload(self.buf.split_to(FRAME_START.len()).freeze()));
                }
                None => {
                    if self.buf.len() > FRAME_START.len() + MAX_TOKEN_LEN + FRAME_END.len() {
                        // Unterminated past the cap: downgrade to payload.
                        events
                            .push(StreamEvent::Payload(self.buf.split_to(FRAME_START.len()).freeze()));
                    } else {
                        // Possibly a frame still in flight; wait for more bytes.
                        break;
                    }
                }
            }
        }

        events
    }

    /// True if bytes are buffered awaiting disambiguation.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Hand back whatever is still buffered as payload.
    ///
    /// Call at end-of-stream: a frame that never completed is payload by
    /// definition once no more bytes can arrive.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

/// First index of `needle` in `haystack`, byte-wise.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest proper suffix of `buf` that is a prefix of `needle`.
fn partial_suffix_len(buf: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if buf[buf.len() - len..] == needle[..len] {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Merge adjacent payload events so chunking-dependent splits compare equal.
    fn normalize(events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        let mut out: Vec<StreamEvent> = Vec::new();
        for ev in events {
            match (&ev, out.last_mut()) {
                (StreamEvent::Payload(b), Some(StreamEvent::Payload(acc))) => {
                    let mut merged = acc.to_vec();
                    merged.extend_from_slice(b);
                    *acc = Bytes::from(merged);
                }
                _ => out.push(ev),
            }
        }
        out
    }

    fn scan_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut scanner = TokenScanner::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(scanner.feed(chunk));
        }
        if let Some(tail) = scanner.finish() {
            events.push(StreamEvent::Payload(tail));
        }
        normalize(events)
    }

    #[test]
    fn test_fragmented_frames_across_reads() {
        // The canonical fragmentation scenario.
        let events = scan_chunks(&[b"A__#GET", b"VER#__B__#KEEPALIVE#__C"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::Payload(Bytes::from_static(b"A")),
                StreamEvent::Control(ControlFrame::GetVer),
                StreamEvent::Payload(Bytes::from_static(b"B")),
                StreamEvent::Control(ControlFrame::Keepalive),
                StreamEvent::Payload(Bytes::from_static(b"C")),
            ]
        );
    }

    #[test]
    fn test_coalesced_frames_single_read() {
        let events = scan_chunks(&[b"__#GETVER#____#GET_KA_TIMEOUT#__"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::Control(ControlFrame::GetVer),
                StreamEvent::Control(ControlFrame::GetKaTimeout),
            ]
        );
    }

    #[test]
    fn test_chunking_invariance() {
        // Same event sequence no matter how the input is split.
        let input: &[u8] = b"pre__#BR_VER_0.0.70#__mid__#MY_KA_TIMEOUT_30#__post\x00\xffbin";
        let whole = scan_chunks(&[input]);
        for split_a in 0..input.len() {
            for split_b in split_a..input.len() {
                let chunked =
                    scan_chunks(&[&input[..split_a], &input[split_a..split_b], &input[split_b..]]);
                assert_eq!(chunked, whole, "split at {split_a}/{split_b}");
            }
        }
    }

    #[test]
    fn test_trailing_partial_opener_is_held() {
        let mut scanner = TokenScanner::new();
        let events = scanner.feed(b"data__");
        assert_eq!(events, vec![StreamEvent::Payload(Bytes::from_static(b"data"))]);
        assert!(scanner.has_partial());
        // The held "__" turns out to be payload after all.
        let events = scanner.feed(b"x");
        assert_eq!(events, vec![StreamEvent::Payload(Bytes::from_static(b"__x"))]);
    }

    #[test]
    fn test_open_frame_waits_for_terminator() {
        let mut scanner = TokenScanner::new();
        assert_eq!(scanner.feed(b"__#DISCONN"), vec![]);
        assert_eq!(
            scanner.feed(b"ECT#__"),
            vec![StreamEvent::Control(ControlFrame::Disconnect)]
        );
        assert!(!scanner.has_partial());
    }

    #[test]
    fn test_unterminated_past_cap_downgrades_to_payload() {
        let mut scanner = TokenScanner::new();
        let mut garbage = b"__#".to_vec();
        garbage.extend(std::iter::repeat(b'X').take(MAX_TOKEN_LEN + FRAME_END.len() + 1));
        let mut events = scanner.feed(&garbage);
        events.extend(scanner.finish().map(StreamEvent::Payload));
        let events = normalize(events);
        assert_eq!(events.len(), 1);
        let StreamEvent::Payload(ref payload) = events[0] else {
            panic!("expected payload, got {events:?}");
        };
        assert_eq!(&payload[..], &garbage[..]);
    }

    #[test]
    fn test_overlong_terminated_frame_is_payload() {
        let mut garbage = b"__#".to_vec();
        garbage.extend(std::iter::repeat(b'Y').take(MAX_TOKEN_LEN + 1));
        garbage.extend_from_slice(b"#__");
        let events = scan_chunks(&[&garbage]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Payload(ref p) if p[..] == garbage[..]));
    }

    #[test]
    fn test_binary_payload_with_lone_marker_bytes() {
        // '#' and '_' bytes scattered through binary data are plain payload.
        let input: &[u8] = &[0x00, b'#', b'_', 0xE0, b'_', b'#', 0xFF, b'_'];
        let events = scan_chunks(&[input]);
        assert_eq!(events, vec![StreamEvent::Payload(Bytes::copy_from_slice(input))]);
    }

    #[test]
    fn test_frame_inside_binary_run() {
        let mut input = vec![0x01, 0x02, b'_', b'_'];
        input.extend_from_slice(b"__#KEEPALIVE#__");
        input.extend_from_slice(&[0x03]);
        let events = scan_chunks(&[&input]);
        assert_eq!(
            events,
            vec![
                StreamEvent::Payload(Bytes::from_static(&[0x01, 0x02, b'_', b'_'])),
                StreamEvent::Control(ControlFrame::Keepalive),
                StreamEvent::Payload(Bytes::from_static(&[0x03])),
            ]
        );
    }

    #[test]
    fn test_byte_for_byte_payload_preservation() {
        // Every byte value survives the scanner untouched.
        let input: Vec<u8> = (0u8..=255).collect();
        let events = scan_chunks(&[&input]);
        assert_eq!(events, vec![StreamEvent::Payload(Bytes::from(input.clone()))]);
    }
}
