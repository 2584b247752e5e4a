use std::fmt;
use std::io::{self, Read};
use std::result::Result;

use bgp_rs::{Capabilities, Message, Reader};
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use twoway::find_bytes;

use super::{MessageError, BGP_ERR_MESSAGE_HEADER};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// An error on the framed BGP stream.
///
/// A `Message` error covers exactly one skipped PDU: the stream stays
/// usable and the session decides whether to answer with a NOTIFICATION.
/// An `Io` error means the transport itself is gone.
#[derive(Debug)]
pub enum CodecError {
    Message(MessageError),
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Message(err) => err.fmt(f),
            CodecError::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(error: io::Error) -> Self {
        CodecError::Io(error)
    }
}

#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    fn get_reader<T>(&self, stream: T) -> Reader<T, Capabilities>
    where
        T: Read,
    {
        Reader::<T, Capabilities>::new(stream)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    // Look for a BGP message (preamble + length), using bgp-rs to decode.
    // The buffer is advanced past the PDU before parsing so a malformed
    // message is skipped rather than wedging the stream.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, CodecError> {
        let range = match find_msg_range(buf) {
            Some(range) => range,
            None => return Ok(None),
        };
        if buf.len() < range.stop {
            // Await the rest of the message
            return Ok(None);
        }
        let message_buf = buf[range.start..range.stop].to_vec();
        buf.advance(range.stop);
        let mut reader = self.get_reader(&message_buf[..]);
        match reader.read() {
            Ok((_header, message)) => Ok(Some(message)),
            Err(err) => Err(CodecError::Message(MessageError::new(
                BGP_ERR_MESSAGE_HEADER,
                2, // bad message length
                &err.to_string(),
            ))),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        message.encode(&mut buf.writer()).map_err(CodecError::from)
    }
}

#[derive(Debug)]
struct MsgRange {
    start: usize,
    stop: usize,
}

/// Given a stream of bytes, find the start and end of a BGP message
fn find_msg_range(data: &[u8]) -> Option<MsgRange> {
    let start = find_bytes(data, &[255; 16])?;
    let buf = &mut (*data).split_at(start).1;
    let mut _preamble: [u8; 16] = [0; 16];
    let _ = buf.read_exact(&mut _preamble);
    let length = match buf.read_u16::<NetworkEndian>() {
        Ok(length) => length,
        // Length bytes not buffered yet
        Err(_) => return None,
    };
    Some(MsgRange {
        start,
        stop: start + (length as usize),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_msg_range() {
        let data: [u8; 64] = [
            255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 0, 45,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let range = find_msg_range(&data).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.stop, 45);
    }

    #[test]
    fn test_find_msg_range_no_preamble() {
        let data: [u8; 32] = [
            0, 45, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0,
        ];
        assert!(find_msg_range(&data).is_none());
    }

    #[test]
    fn test_decode_waits_for_full_message() {
        let mut codec = MessageCodec::new();
        // Preamble + length of 45, but only 20 bytes buffered
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[255u8; 16]);
        buf.extend_from_slice(&[0, 45, 4, 0]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert!(decoded.is_none());
        // Nothing consumed until the message completes
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn test_decode_keepalive() {
        let mut codec = MessageCodec::new();
        // 19-byte KEEPALIVE: preamble + length + type 4
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[255u8; 16]);
        buf.extend_from_slice(&[0, 19, 4]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert!(matches!(decoded, Some(Message::KeepAlive)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_error_skips_message() {
        let mut codec = MessageCodec::new();
        // Bogus message type 99 with a valid frame
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[255u8; 16]);
        buf.extend_from_slice(&[0, 19, 99]);
        let result = codec.decode(&mut buf);
        match result {
            Err(CodecError::Message(err)) => {
                assert_eq!(err.code, BGP_ERR_MESSAGE_HEADER);
            }
            other => panic!("Expected message error, got {:?}", other),
        }
        // The malformed PDU was consumed; the stream can continue
        assert!(buf.is_empty());
    }
}
