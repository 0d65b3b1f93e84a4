/// IRC line codec: frames a byte stream from a remote network into messages.
///
/// Accepts both `\r\n` and bare `\n` terminators (plenty of ircds send the
/// latter). Bytes that are not valid UTF-8 are decoded lossily instead of
/// killing the connection, and lines that fail to parse are logged and
/// skipped: one bad line from a server must never tear down a user's link.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::message::Message;

/// Upper bound on a single buffered line (IRCv3 tags push past 512 bytes).
const MAX_LINE_LENGTH: usize = 8191;

/// Codec error: only conditions that make the stream unusable.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(lf) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            let mut line = src.split_to(lf);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            match Message::parse(&text) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    warn!(line = %text, "dropping unparseable line: {e}");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        // Embedded newlines would smuggle a second command onto the wire.
        let wire = wire.replace(['\r', '\n'], " ");
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
