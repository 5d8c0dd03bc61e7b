//! In-band framing for text lines and file offers sharing one byte stream.
//!
//! Text has no delimiter of its own: whatever a single read yields outside of
//! a file transfer is one message. A file offer starts with
//! `FILE:<name>:<size>`, optionally terminated by `\n`, and is followed by
//! exactly `size` raw bytes. [`FrameDecoder`] tracks how many of those bytes
//! are still owed, so payloads survive arbitrary read boundaries and may
//! contain anything, the `FILE:` prefix included.

use std::{collections::VecDeque, io, mem};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

pub const FILE_PREFIX: &[u8] = b"FILE:";
/// Longest header the decoder buffers while waiting for it to complete.
pub const MAX_HEADER_LEN: usize = 512;

const HEADER_TERMINATOR: u8 = b'\n';
const NAME_SEPARATOR: u8 = b':';
// Large declared sizes grow the buffer as bytes actually arrive.
const MAX_PREALLOCATION: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Vec<u8>),
    /// A named blob; the declared size is `payload.len()`.
    FileOffer { name: String, payload: Vec<u8> },
}

impl Message {
    pub fn text(body: impl Into<Vec<u8>>) -> Self {
        Self::Text(body.into())
    }

    /// Builds a file offer whose name survives the header grammar.
    pub fn file_offer(name: &str, payload: Vec<u8>) -> Self {
        let name = name
            .chars()
            .map(|c| if c == ':' || c.is_control() { '_' } else { c })
            .collect();
        Self::FileOffer { name, payload }
    }

    /// Wire form of the message. File offers always carry the `\n` terminator
    /// so that header and payload can travel in one write.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Text(body) => body.clone(),
            Message::FileOffer { name, payload } => {
                let header = format!("FILE:{name}:{}\n", payload.len());
                let mut encoded = Vec::with_capacity(header.len() + payload.len());
                encoded.extend_from_slice(header.as_bytes());
                encoded.extend_from_slice(payload);
                encoded
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_file_size: u64,
    /// Require `\n` after the size instead of also accepting a read boundary.
    pub strict_headers: bool,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_file_size: crate::config::DEFAULT_MAX_FILE_SIZE,
            strict_headers: false,
        }
    }
}

#[derive(Debug)]
enum DecodeState {
    Idle,
    Header(Vec<u8>),
    Payload {
        name: String,
        size: usize,
        payload: Vec<u8>,
    },
}

/// Byte-stream to [`Message`] state machine for one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    limits: FrameLimits,
}

impl FrameDecoder {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            state: DecodeState::Idle,
            limits,
        }
    }

    /// True between messages, false while a header or payload is incomplete.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Idle)
    }

    /// Payload bytes still expected for the file offer in progress.
    pub fn bytes_owed(&self) -> Option<usize> {
        match &self.state {
            DecodeState::Payload { size, payload, .. } => Some(size - payload.len()),
            _ => None,
        }
    }

    /// Consumes the bytes of one read and returns every message they complete.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        while !input.is_empty() {
            match mem::replace(&mut self.state, DecodeState::Idle) {
                DecodeState::Idle => {
                    if input.starts_with(FILE_PREFIX) {
                        self.state = DecodeState::Header(Vec::new());
                    } else {
                        messages.push(Message::Text(input.to_vec()));
                        input = &[];
                    }
                }
                DecodeState::Header(mut header) => {
                    // Buffered bytes are always header; the header never ends inside them.
                    let buffered = header.len();
                    header.extend_from_slice(input);

                    match scan_header(&header, self.limits.strict_headers)? {
                        HeaderScan::Complete {
                            name,
                            size,
                            consumed,
                        } => {
                            if consumed > MAX_HEADER_LEN {
                                return Err(header_too_long());
                            }
                            input = &input[consumed.saturating_sub(buffered)..];
                            self.arm_payload(name, size, &mut messages)?;
                        }
                        HeaderScan::Incomplete => {
                            if header.len() > MAX_HEADER_LEN {
                                return Err(header_too_long());
                            }
                            input = &[];
                            self.state = DecodeState::Header(header);
                        }
                    }
                }
                DecodeState::Payload {
                    name,
                    size,
                    mut payload,
                } => {
                    let take = (size - payload.len()).min(input.len());
                    payload.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if payload.len() == size {
                        messages.push(Message::FileOffer { name, payload });
                    } else {
                        self.state = DecodeState::Payload {
                            name,
                            size,
                            payload,
                        };
                    }
                }
            }
        }

        Ok(messages)
    }

    fn arm_payload(&mut self, name: String, size: u64, messages: &mut Vec<Message>) -> Result<()> {
        let too_large = RelayError::FileTooLarge {
            size,
            max: self.limits.max_file_size,
        };
        if size > self.limits.max_file_size {
            return Err(too_large);
        }
        let size = usize::try_from(size).map_err(|_| too_large)?;

        if size == 0 {
            messages.push(Message::FileOffer {
                name,
                payload: Vec::new(),
            });
        } else {
            self.state = DecodeState::Payload {
                name,
                size,
                payload: Vec::with_capacity(size.min(MAX_PREALLOCATION)),
            };
        }
        Ok(())
    }
}

enum HeaderScan {
    /// `consumed` counts the header bytes, terminator included.
    Complete {
        name: String,
        size: u64,
        consumed: usize,
    },
    Incomplete,
}

/// Looks for the end of the header at the start of `header`, which begins
/// with [`FILE_PREFIX`] and may carry payload bytes after the header.
///
/// A `\n` ends the header and the name runs up to the last `:` before it.
/// Unless `strict`, a header without terminator ends either at the read
/// boundary right after its size or at the first non-digit after the size.
fn scan_header(header: &[u8], strict: bool) -> Result<HeaderScan> {
    let body = &header[FILE_PREFIX.len()..];
    let line_end = body.iter().position(|&b| b == HEADER_TERMINATOR);

    let mut terminated_error = None;
    match line_end {
        Some(end) => match parse_terminated(&body[..end]) {
            Ok((name, size)) => {
                return Ok(HeaderScan::Complete {
                    name,
                    size,
                    consumed: FILE_PREFIX.len() + end + 1,
                });
            }
            Err(err) if strict => return Err(err),
            Err(err) => terminated_error = Some(err),
        },
        None if strict => return Ok(HeaderScan::Incomplete),
        None => {
            if let Some(separator) = trailing_size(body) {
                let (name, size) = parse_fields(&body[..separator], &body[separator + 1..])?;
                return Ok(HeaderScan::Complete {
                    name,
                    size,
                    consumed: header.len(),
                });
            }
        }
    }

    // The payload may contain anything, but the header itself never spans a newline.
    let line = &body[..line_end.unwrap_or(body.len())];
    if let Some((separator, digits_end)) = embedded_size(line) {
        let (name, size) = parse_fields(&line[..separator], &line[separator + 1..digits_end])?;
        return Ok(HeaderScan::Complete {
            name,
            size,
            consumed: FILE_PREFIX.len() + digits_end,
        });
    }

    match terminated_error {
        Some(err) => Err(err),
        None => Ok(HeaderScan::Incomplete),
    }
}

fn parse_terminated(line: &[u8]) -> Result<(String, u64)> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let separator = line
        .iter()
        .rposition(|&b| b == NAME_SEPARATOR)
        .ok_or_else(|| RelayError::malformed("missing size"))?;
    parse_fields(&line[..separator], &line[separator + 1..])
}

/// Position of the `:` when `body` ends in `:<digits>` after a non-empty name.
fn trailing_size(body: &[u8]) -> Option<usize> {
    let digits = body.iter().rev().take_while(|b| b.is_ascii_digit()).count();
    let separator = body.len().checked_sub(digits + 1)?;
    (digits > 0 && separator > 0 && body[separator] == NAME_SEPARATOR).then_some(separator)
}

/// First `:<digits>` followed by a non-digit inside `line`, as the `:`
/// position and the end of the digits.
fn embedded_size(line: &[u8]) -> Option<(usize, usize)> {
    line.iter()
        .enumerate()
        .filter(|&(at, &b)| b == NAME_SEPARATOR && at > 0)
        .find_map(|(separator, _)| {
            let digits = line[separator + 1..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            let digits_end = separator + 1 + digits;
            (digits > 0 && digits_end < line.len()).then_some((separator, digits_end))
        })
}

fn parse_fields(name: &[u8], size: &[u8]) -> Result<(String, u64)> {
    let name =
        std::str::from_utf8(name).map_err(|_| RelayError::malformed("file name is not UTF-8"))?;
    if name.is_empty() {
        return Err(RelayError::malformed("empty file name"));
    }

    let size = String::from_utf8_lossy(size);
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RelayError::malformed(format!(
            "size {size:?} is not a non-negative integer"
        )));
    }
    let size = size
        .parse()
        .map_err(|_| RelayError::malformed(format!("size {size} is out of range")))?;

    Ok((name.to_string(), size))
}

fn header_too_long() -> RelayError {
    RelayError::malformed(format!("header longer than {MAX_HEADER_LEN} bytes"))
}

/// Pairs a transport read half with a [`FrameDecoder`].
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
    pending: VecDeque<Message>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, limits: FrameLimits, read_buffer_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(limits),
            buffer: vec![0; read_buffer_size.max(1)],
            pending: VecDeque::new(),
        }
    }

    /// Next complete message, or `None` on a clean end of stream.
    ///
    /// Cancel safe: decoder state and decoded messages live in `self`, so a
    /// dropped call loses nothing that a later call would have returned.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }

            let read = self.reader.read(&mut self.buffer).await?;
            if read == 0 {
                if self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a file offer",
                )
                .into());
            }

            let decoded = self.decoder.feed(&self.buffer[..read])?;
            self.pending.extend(decoded);
        }
    }
}

/// Encodes `message` and writes it as a single send.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &[u8] = b"Hello, world!";

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(FrameLimits::default())
    }

    fn feed_all(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> Vec<Message> {
        chunks
            .iter()
            .flat_map(|chunk| decoder.feed(chunk).expect("chunk decodes"))
            .collect()
    }

    fn report_offer() -> Message {
        Message::FileOffer {
            name: "report.txt".into(),
            payload: REPORT.to_vec(),
        }
    }

    #[test]
    fn plain_read_is_one_text_message() {
        let mut decoder = decoder();
        let messages = decoder.feed(b"hello there").expect("decodes");
        assert_eq!(messages, vec![Message::text("hello there")]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn payload_is_reassembled_for_any_chunk_size() {
        for chunk_size in [1, 7, REPORT.len()] {
            let mut decoder = decoder();
            assert!(decoder.feed(b"FILE:report.txt:13").expect("header").is_empty());
            assert_eq!(decoder.bytes_owed(), Some(13));

            let mut messages = Vec::new();
            for chunk in REPORT.chunks(chunk_size) {
                messages.extend(decoder.feed(chunk).expect("payload chunk"));
            }

            assert_eq!(messages, vec![report_offer()], "chunk size {chunk_size}");
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn bytes_after_the_payload_are_decoded_as_text() {
        let mut decoder = decoder();
        let mut chunk = REPORT.to_vec();
        chunk.push(b'!');

        let messages = feed_all(&mut decoder, &[b"FILE:report.txt:13", &chunk]);

        assert_eq!(messages, vec![report_offer(), Message::text("!")]);
    }

    #[test]
    fn terminated_header_and_payload_in_one_read() {
        let mut decoder = decoder();
        let encoded = report_offer().encode();

        let messages = decoder.feed(&encoded).expect("decodes");

        assert_eq!(messages, vec![report_offer()]);
    }

    #[test]
    fn payload_may_contain_the_file_prefix() {
        let payload = b"FILE:x:1\nFILE:".to_vec();
        let offer = Message::FileOffer {
            name: "nested".into(),
            payload,
        };
        let encoded = offer.encode();
        let mut decoder = decoder();

        let messages = feed_all(&mut decoder, &[&encoded[..10], &encoded[10..]]);

        assert_eq!(messages, vec![offer]);
    }

    #[test]
    fn incomplete_header_waits_for_more_bytes() {
        let mut decoder = decoder();

        let messages = feed_all(&mut decoder, &[b"FILE:rep", b"ort.txt:", b"3\nabc"]);

        assert_eq!(
            messages,
            vec![Message::FileOffer {
                name: "report.txt".into(),
                payload: b"abc".to_vec(),
            }]
        );
    }

    #[test]
    fn strict_headers_survive_a_split_inside_the_size() {
        let mut decoder = FrameDecoder::new(FrameLimits {
            strict_headers: true,
            ..FrameLimits::default()
        });

        let messages = feed_all(&mut decoder, &[b"FILE:report.txt:1", b"3\nHello, ", b"world!"]);

        assert_eq!(messages, vec![report_offer()]);
    }

    #[test]
    fn zero_sized_offer_completes_immediately() {
        let mut decoder = decoder();

        let messages = decoder.feed(b"FILE:empty.bin:0\nafter").expect("decodes");

        assert_eq!(
            messages,
            vec![
                Message::FileOffer {
                    name: "empty.bin".into(),
                    payload: Vec::new(),
                },
                Message::text("after"),
            ]
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let cases: [&[u8]; 4] = [
            b"FILE::3\n",
            b"FILE:a.txt:x\n",
            b"FILE:a.txt:-4\n",
            b"FILE:a.txt\n",
        ];
        for case in cases {
            let result = decoder().feed(case);
            assert!(
                matches!(result, Err(RelayError::MalformedHeader { .. })),
                "{:?} should be malformed",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn file_names_may_contain_colons() {
        let messages = decoder().feed(b"FILE:a:b.txt:3\nxyz").expect("decodes");

        assert_eq!(
            messages,
            vec![Message::FileOffer {
                name: "a:b.txt".into(),
                payload: b"xyz".to_vec(),
            }]
        );
    }

    #[test]
    fn unterminated_header_may_share_a_read_with_its_payload() {
        let messages = decoder()
            .feed(b"FILE:report.txt:13Hello, world!")
            .expect("decodes");
        assert_eq!(messages, vec![report_offer()]);

        // A newline inside the payload does not end the header early.
        let messages = decoder().feed(b"FILE:r.txt:6ab\ncde").expect("decodes");
        assert_eq!(
            messages,
            vec![Message::FileOffer {
                name: "r.txt".into(),
                payload: b"ab\ncde".to_vec(),
            }]
        );
    }

    #[test]
    fn unterminated_header_with_colon_name_at_read_boundary() {
        let mut decoder = decoder();

        let messages = feed_all(&mut decoder, &[b"FILE:a:b.txt:3", b"xyz"]);

        assert_eq!(
            messages,
            vec![Message::FileOffer {
                name: "a:b.txt".into(),
                payload: b"xyz".to_vec(),
            }]
        );
    }

    #[test]
    fn size_without_separator_waits_in_lenient_mode() {
        let mut decoder = decoder();

        assert!(decoder.feed(b"FILE:a.txt:x").expect("buffered").is_empty());
        assert!(!decoder.is_idle());

        let messages = decoder.feed(b":2\nok").expect("decodes");
        assert_eq!(
            messages,
            vec![Message::FileOffer {
                name: "a.txt:x".into(),
                payload: b"ok".to_vec(),
            }]
        );
    }

    #[test]
    fn text_and_header_in_one_read_stay_text() {
        // Text has no delimiter, so a header glued to it is part of the text.
        let messages = decoder().feed(b"hiFILE:r.txt:3\nabc").expect("decodes");
        assert_eq!(messages, vec![Message::text("hiFILE:r.txt:3\nabc")]);
    }

    #[test]
    fn runaway_header_is_rejected() {
        let mut header = b"FILE:".to_vec();
        header.extend(std::iter::repeat(b'a').take(MAX_HEADER_LEN));

        let result = decoder().feed(&header);

        assert!(matches!(result, Err(RelayError::MalformedHeader { .. })));
    }

    #[test]
    fn oversized_offer_is_rejected() {
        let mut decoder = FrameDecoder::new(FrameLimits {
            max_file_size: 10,
            ..FrameLimits::default()
        });

        let result = decoder.feed(b"FILE:big.bin:11\n");

        assert!(matches!(
            result,
            Err(RelayError::FileTooLarge { size: 11, max: 10 })
        ));
    }

    #[test]
    fn file_offer_names_are_sanitized() {
        let offer = Message::file_offer("a:b\nc", b"xy".to_vec());
        assert_eq!(offer.encode(), b"FILE:a_b_c:2\nxy".to_vec());
    }

    #[tokio::test]
    async fn reader_reports_eof_inside_a_payload() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, FrameLimits::default(), 1024);

        client.write_all(b"FILE:report.txt:13\nHello").await.expect("write");
        drop(client);

        let result = reader.next_message().await;
        assert!(matches!(
            result,
            Err(RelayError::Transport(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn reader_returns_none_on_clean_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, FrameLimits::default(), 1024);

        write_message(&mut client, &Message::text("bye")).await.expect("write");
        drop(client);

        assert_eq!(
            reader.next_message().await.expect("text"),
            Some(Message::text("bye"))
        );
        assert_eq!(reader.next_message().await.expect("eof"), None);
    }
}
