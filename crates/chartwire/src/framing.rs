//! Wire framing: `~m~<length>~m~<payload>` repeated with no separator.
//!
//! The length marker counts the payload's characters (Unicode scalar values).
//! Remotes that count UTF-8 bytes or UTF-16 units instead are tolerated: the
//! payload then ends at the delimiter found at that count. Frames may arrive
//! concatenated in one read or split across several reads; [`Framer`]
//! buffers until a frame is complete and never yields a partial one.

use tracing::{debug, warn};

use crate::error::FrameError;

/// Literal frame delimiter
pub const DELIMITER: &str = "~m~";

/// Largest payload accepted from the remote
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length markers longer than this cannot be valid
const MAX_LEN_DIGITS: usize = 9;

/// One decoded frame: declared length plus payload text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    len: usize,
    payload: String,
}

impl Frame {
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            len: payload.chars().count(),
            payload,
        }
    }

    /// Length as declared on the wire
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }

    /// Serialize back to wire form
    pub fn encode(&self) -> String {
        format!("{DELIMITER}{}{DELIMITER}{}", self.len, self.payload)
    }
}

/// Frame a payload for the wire.
pub fn encode(payload: &str) -> String {
    Frame::new(payload).encode()
}

/// Incremental decoder over a stream of text chunks.
#[derive(Debug, Default)]
pub struct Framer {
    buf: String,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw read and return every frame it completes, in order.
    ///
    /// An error means the stream can no longer be trusted; the buffer is left
    /// as-is and the caller is expected to tear the connection down.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Frame>, FrameError> {
        self.buf.push_str(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, used)) = parse_frame(&self.buf[consumed..], consumed)? {
            consumed += used;
            frames.push(frame);
        }
        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Bytes buffered waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only a prefix of a frame. `offset` is
/// the position of `buf` inside the framer buffer, used for error reporting.
fn parse_frame(buf: &str, offset: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(rest) = strip_delimiter(buf, offset)? else {
        return Ok(None);
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits > MAX_LEN_DIGITS {
        return Err(FrameError::InvalidLength(rest[..digits].to_string()));
    }
    if digits == rest.len() {
        // length marker may continue in the next read
        return Ok(None);
    }
    if digits == 0 {
        let shown: String = rest.chars().take(MAX_LEN_DIGITS).collect();
        return Err(FrameError::InvalidLength(shown));
    }

    let len: usize = rest[..digits]
        .parse()
        .map_err(|_| FrameError::InvalidLength(rest[..digits].to_string()))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len, MAX_FRAME_LEN));
    }

    let header = DELIMITER.len() + digits;
    let Some(body) = strip_delimiter(&rest[digits..], offset + header)? else {
        return Ok(None);
    };
    let header = header + DELIMITER.len();

    let Some(body_len) = payload_end(body, len, offset + header)? else {
        return Ok(None);
    };

    let frame = Frame {
        len,
        payload: body[..body_len].to_string(),
    };
    Ok(Some((frame, header + body_len)))
}

/// Byte length of the payload at the front of `body`, declared as `len`.
///
/// A character count is tried first. Failing that, the UTF-8 byte and UTF-16
/// unit counts are accepted when a delimiter follows them. Failing that, the
/// payload runs to the first delimiter a payload of `len` characters could
/// reach. Only when no such delimiter can arrive is the frame malformed.
fn payload_end(body: &str, len: usize, offset: usize) -> Result<Option<usize>, FrameError> {
    let char_end = byte_offset(body, len);
    if let Some(end) = char_end {
        let tail = &body[end..];
        if tail.starts_with(DELIMITER) || DELIMITER.starts_with(tail) {
            return Ok(Some(end));
        }
    }

    let delimited = [utf16_offset(body, len), utf8_offset(body, len)]
        .into_iter()
        .flatten()
        .find(|&end| body[end..].starts_with(DELIMITER));
    if let Some(end) = delimited {
        debug!(declared = len, bytes = end, "Frame length is not a character count");
        return Ok(Some(end));
    }

    // not enough characters yet for any reading of the length
    let Some(end) = char_end else {
        return Ok(None);
    };

    match body.find(DELIMITER) {
        Some(idx) if body[..idx].chars().count() <= len => {
            warn!(declared = len, bytes = idx, "Resynchronised on next frame delimiter");
            Ok(Some(idx))
        }
        None if body[end..].chars().count() < DELIMITER.len() => Ok(None),
        _ => Err(FrameError::MissingDelimiter(offset + end)),
    }
}

fn strip_delimiter(buf: &str, offset: usize) -> Result<Option<&str>, FrameError> {
    if let Some(rest) = buf.strip_prefix(DELIMITER) {
        return Ok(Some(rest));
    }
    if DELIMITER.starts_with(buf) {
        Ok(None)
    } else {
        Err(FrameError::MissingDelimiter(offset))
    }
}

/// Byte offset just past the first `chars` characters, if `s` has that many.
fn byte_offset(s: &str, chars: usize) -> Option<usize> {
    if chars == 0 {
        return Some(0);
    }
    match s.char_indices().nth(chars) {
        Some((idx, _)) => Some(idx),
        None => (s.chars().count() == chars).then_some(s.len()),
    }
}

/// Byte offset just past the first `units` UTF-16 code units of `s`.
fn utf16_offset(s: &str, units: usize) -> Option<usize> {
    let mut counted = 0;
    for (idx, c) in s.char_indices() {
        if counted == units {
            return Some(idx);
        }
        counted += c.len_utf16();
        if counted > units {
            return None;
        }
    }
    (counted == units).then_some(s.len())
}

/// `bytes`, if it falls on a character boundary inside `s`.
fn utf8_offset(s: &str, bytes: usize) -> Option<usize> {
    (bytes <= s.len() && s.is_char_boundary(bytes)).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "~m~4~m~~h~1",
        r#"~m~51~m~{"m":"symbol_resolved","p":["chart_1","sds_sym_2"]}"#,
        "~m~0~m~",
        r#"~m~21~m~{"m":"x","p":["~m~"]}"#,
        "~m~5~m~~h~42",
    );

    fn decode_all(chunks: &[&str]) -> Vec<Frame> {
        let mut framer = Framer::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(framer.push(chunk).unwrap());
        }
        assert_eq!(framer.pending(), 0);
        frames
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode("~h~42"), "~m~5~m~~h~42");
        assert_eq!(encode(""), "~m~0~m~");
        assert_eq!(encode(r#"{"m":"a"}"#), r#"~m~9~m~{"m":"a"}"#);
    }

    #[test]
    fn test_concatenated_frames_split_losslessly() {
        let frames = decode_all(&[STREAM]);
        let payloads: Vec<&str> = frames.iter().map(Frame::payload).collect();
        assert_eq!(
            payloads,
            vec![
                "~h~1",
                r#"{"m":"symbol_resolved","p":["chart_1","sds_sym_2"]}"#,
                "",
                r#"{"m":"x","p":["~m~"]}"#,
                "~h~42",
            ]
        );
        for frame in &frames {
            assert_eq!(frame.len(), frame.payload().chars().count());
        }
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let expected = decode_all(&[STREAM]);

        // every single split point
        for split in 0..=STREAM.len() {
            let (a, b) = STREAM.split_at(split);
            assert_eq!(decode_all(&[a, b]), expected, "split at {split}");
        }

        // one character per read
        let chars: Vec<String> = STREAM.chars().map(String::from).collect();
        let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(decode_all(&chunks), expected);

        // uneven strides
        for stride in [2, 3, 7, 13] {
            let chunks: Vec<&str> = (0..STREAM.len())
                .step_by(stride)
                .map(|start| &STREAM[start..(start + stride).min(STREAM.len())])
                .collect();
            assert_eq!(decode_all(&chunks), expected, "stride {stride}");
        }
    }

    #[test]
    fn test_partial_frame_is_held_back() {
        let mut framer = Framer::new();
        assert!(framer.push("~m~10~m~01234").unwrap().is_empty());
        assert!(framer.pending() > 0);

        let frames = framer.push("56789~m~1~m~").unwrap();
        assert_eq!(frames, vec![Frame::new("0123456789")]);

        let frames = framer.push("z").unwrap();
        assert_eq!(frames, vec![Frame::new("z")]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_length_counts_characters() {
        let payload = r#"{"m":"n","p":["Société €"]}"#;
        let wire = encode(payload);
        assert!(wire.starts_with(&format!("~m~{}~m~", payload.chars().count())));
        assert_eq!(decode_all(&[&wire]), vec![Frame::new(payload)]);
    }

    #[test]
    fn test_missing_delimiter_is_fatal() {
        let mut framer = Framer::new();
        assert_eq!(
            framer.push("garbage"),
            Err(FrameError::MissingDelimiter(0))
        );

        // no delimiter within reach of the declared length
        let mut framer = Framer::new();
        assert_eq!(
            framer.push("~m~1~m~a?xy"),
            Err(FrameError::MissingDelimiter(8))
        );
        let mut framer = Framer::new();
        assert_eq!(
            framer.push("~m~2~m~abcd~m~1~m~z"),
            Err(FrameError::MissingDelimiter(9))
        );
    }

    #[test]
    fn test_byte_counted_length_is_tolerated() {
        let payload = r#"{"m":"tick","p":["Société"]}"#;
        assert_ne!(payload.len(), payload.chars().count());
        let wire = format!("~m~{}~m~{}~m~4~m~~h~1", payload.len(), payload);

        let mut framer = Framer::new();
        let frames = framer.push(&wire).unwrap();
        let payloads: Vec<&str> = frames.iter().map(Frame::payload).collect();
        assert_eq!(payloads, vec![payload, "~h~1"]);
        assert_eq!(frames[0].len(), payload.len());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_utf16_counted_length_is_tolerated() {
        let payload = r#"{"m":"tick","p":["📈 up"]}"#;
        let units = payload.encode_utf16().count();
        assert_ne!(units, payload.chars().count());
        let wire = format!("~m~{units}~m~{payload}~m~4~m~~h~1");

        // also across a split inside the payload
        for split in [wire.len(), 20] {
            let mut framer = Framer::new();
            let mut frames = framer.push(&wire[..split]).unwrap();
            frames.extend(framer.push(&wire[split..]).unwrap());
            let payloads: Vec<&str> = frames.iter().map(Frame::payload).collect();
            assert_eq!(payloads, vec![payload, "~h~1"], "split at {split}");
        }
    }

    #[test]
    fn test_resynchronises_on_overstated_length() {
        // the declared length overshoots every counting; the next delimiter wins
        let wire = "~m~12~m~{\"m\":1}~m~4~m~~h~1";
        let mut framer = Framer::new();
        let frames = framer.push(wire).unwrap();
        let payloads: Vec<&str> = frames.iter().map(Frame::payload).collect();
        assert_eq!(payloads, vec![r#"{"m":1}"#, "~h~1"]);
    }

    #[test]
    fn test_non_numeric_length_is_fatal() {
        let mut framer = Framer::new();
        assert!(matches!(
            framer.push("~m~abc~m~x"),
            Err(FrameError::InvalidLength(_))
        ));

        // length marker not followed by a delimiter
        let mut framer = Framer::new();
        assert!(matches!(
            framer.push("~m~12x~m~"),
            Err(FrameError::MissingDelimiter(5))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut framer = Framer::new();
        assert!(matches!(
            framer.push("~m~999999999~m~"),
            Err(FrameError::TooLarge(999_999_999, MAX_FRAME_LEN))
        ));
        let mut framer = Framer::new();
        assert!(matches!(
            framer.push("~m~12345678901~m~"),
            Err(FrameError::InvalidLength(_))
        ));
    }
}
