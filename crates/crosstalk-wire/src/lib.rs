#![deny(unsafe_code)]

//! Wire format for the crosstalk IPC protocol.
//!
//! Every connection starts with a fixed header (magic, version, identity
//! block). After that the client writes request frames and the server writes
//! response frames; the two directions are framed independently and
//! correlated only by call id. All integers are big-endian.
//!
//! ```text
//! header:   [magic:4][version:1][identity_len:i32][identity bytes]
//! request:  [call_id:i32][payload_len:i32][payload bytes]
//! ping:     [call_id:i32 = -1]
//! response: [call_id:i32][is_error:u8]
//!           if is_error: [class:utf_string][message:utf_string]
//!           else:        [payload bytes, self-delimiting]
//! ```
//!
//! A `utf_string` is `[byte_len:i32][UTF-8 bytes]`.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Magic bytes opening every connection.
pub const MAGIC: [u8; 4] = *b"xtlk";

/// Current protocol version, written right after the magic.
pub const VERSION: u8 = 1;

/// Call id reserved for keepalive pings. Never issued for a real call.
pub const PING_CALL_ID: i32 = -1;

/// Maximum accepted size for a length-prefixed field.
///
/// Frames larger than this are rejected to prevent memory exhaustion from a
/// corrupt or hostile peer.
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Serialization contract for request parameters and response values.
///
/// Requests are written into an in-memory buffer and length-prefixed by the
/// connection, so `write` is synchronous. Response payloads carry no length
/// prefix on the wire and must read themselves off the stream, so `read` is
/// asynchronous and self-delimiting.
pub trait Payload: Send + Sized + 'static {
    /// Append this value's wire form to `buf`.
    fn write(&self, buf: &mut Vec<u8>);

    /// Read one value off the stream.
    fn read<R>(src: &mut R) -> impl Future<Output = io::Result<Self>> + Send
    where
        R: AsyncRead + Unpin + Send;
}

/// An opaque, length-prefixed byte payload: `[len:i32][bytes]`.
///
/// The simplest [`Payload`]; callers that do their own encoding layer on top
/// of the client use this to move raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBytes(pub Vec<u8>);

impl Payload for RawBytes {
    fn write(&self, buf: &mut Vec<u8>) {
        put_i32(buf, self.0.len() as i32);
        buf.extend_from_slice(&self.0);
    }

    async fn read<R>(src: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = read_len(src, "byte payload").await?;
        let mut data = vec![0u8; len];
        src.read_exact(&mut data).await?;
        Ok(RawBytes(data))
    }
}

/// An identity carried once per connection, in the header.
///
/// The content is opaque to the protocol; the client never sends it per
/// call and the server never echoes it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user: String,
    groups: Vec<String>,
}

impl Identity {
    /// Create an identity for the given user with no groups.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
        }
    }

    /// Attach group names to this identity.
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// The user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The group names.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user)
    }
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a `utf_string` to `buf`.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    put_i32(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Read a length prefix, rejecting negative and oversized values.
async fn read_len<R>(src: &mut R, what: &str) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let len = src.read_i32().await?;
    if len < 0 || len as usize > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid {what} length: {len}"),
        ));
    }
    Ok(len as usize)
}

/// Read a `utf_string` off the stream.
pub async fn read_string<R>(src: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = read_len(src, "string").await?;
    let mut data = vec![0u8; len];
    src.read_exact(&mut data).await?;
    String::from_utf8(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid utf-8: {e}")))
}

async fn read_bool<R>(src: &mut R) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    match src.read_u8().await? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid boolean byte: {b:#04x}"),
        )),
    }
}

fn write_identity_block(buf: &mut Vec<u8>, identity: Option<&Identity>) {
    match identity {
        None => buf.push(0),
        Some(id) => {
            buf.push(1);
            write_string(buf, &id.user);
            put_i32(buf, id.groups.len() as i32);
            for group in &id.groups {
                write_string(buf, group);
            }
        }
    }
}

/// Build the connection header: magic, version, and the length-prefixed
/// identity block. Written exactly once, before any call.
pub fn connection_header(identity: Option<&Identity>) -> Vec<u8> {
    let mut block = Vec::new();
    write_identity_block(&mut block, identity);

    let mut header = Vec::with_capacity(MAGIC.len() + 1 + 4 + block.len());
    header.extend_from_slice(&MAGIC);
    header.push(VERSION);
    put_i32(&mut header, block.len() as i32);
    header.extend_from_slice(&block);
    header
}

/// Read and validate a connection header, returning the identity it carried.
pub async fn read_connection_header<R>(src: &mut R) -> io::Result<Option<Identity>>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    src.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad magic: {magic:02x?}"),
        ));
    }
    let version = src.read_u8().await?;
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported protocol version: {version}"),
        ));
    }

    let block_len = read_len(src, "identity block").await?;
    let mut block = vec![0u8; block_len];
    src.read_exact(&mut block).await?;

    let mut cursor = block.as_slice();
    match cursor.read_u8().await? {
        0 => Ok(None),
        1 => {
            let user = read_string(&mut cursor).await?;
            let group_count = read_len(&mut cursor, "group count").await?;
            let mut groups = Vec::with_capacity(group_count);
            for _ in 0..group_count {
                groups.push(read_string(&mut cursor).await?);
            }
            Ok(Some(Identity::new(user).with_groups(groups)))
        }
        b => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid identity presence byte: {b:#04x}"),
        )),
    }
}

/// Build a request frame: `[call_id][payload_len][payload]`.
pub fn request_frame(call_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    put_i32(&mut frame, call_id);
    put_i32(&mut frame, payload.len() as i32);
    frame.extend_from_slice(payload);
    frame
}

/// Build a successful response frame: `[call_id][0][payload]`.
pub fn response_frame(call_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    put_i32(&mut frame, call_id);
    frame.push(0);
    frame.extend_from_slice(payload);
    frame
}

/// Build an error response frame: `[call_id][1][class][message]`.
pub fn error_response_frame(call_id: i32, class: &str, message: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    put_i32(&mut frame, call_id);
    frame.push(1);
    write_string(&mut frame, class);
    write_string(&mut frame, message);
    frame
}

/// One client-to-server frame, as seen by the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keepalive, no payload follows.
    Ping,
    /// A call with its length-prefixed payload.
    Request { call_id: i32, payload: Vec<u8> },
}

/// Read one inbound frame off the stream (server side).
pub async fn read_inbound<R>(src: &mut R) -> io::Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    let call_id = src.read_i32().await?;
    if call_id == PING_CALL_ID {
        return Ok(Inbound::Ping);
    }
    if call_id < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative call id: {call_id}"),
        ));
    }
    let len = read_len(src, "request payload").await?;
    let mut payload = vec![0u8; len];
    src.read_exact(&mut payload).await?;
    Ok(Inbound::Request { call_id, payload })
}

/// The fixed leading part of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    /// The call this response answers.
    pub call_id: i32,
    /// Whether an error (class, message) follows instead of a value.
    pub is_error: bool,
}

/// Read a response head off the stream (client side).
pub async fn read_response_head<R>(src: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let call_id = src.read_i32().await?;
    let is_error = read_bool(src).await?;
    Ok(ResponseHead { call_id, is_error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = connection_header(None);
        assert_eq!(&header[..4], b"xtlk");
        assert_eq!(header[4], VERSION);
        // Absent identity is a one-byte block.
        assert_eq!(&header[5..9], &1i32.to_be_bytes());
        assert_eq!(header[9], 0);
        assert_eq!(header.len(), 10);
    }

    #[tokio::test]
    async fn header_roundtrip_with_identity() {
        let identity = Identity::new("scanner").with_groups(["ops", "readers"]);
        let header = connection_header(Some(&identity));

        let mut src = header.as_slice();
        let decoded = read_connection_header(&mut src).await.unwrap();
        assert_eq!(decoded, Some(identity));
        assert!(src.is_empty());
    }

    #[tokio::test]
    async fn header_roundtrip_without_identity() {
        let header = connection_header(None);
        let mut src = header.as_slice();
        assert_eq!(read_connection_header(&mut src).await.unwrap(), None);
    }

    #[tokio::test]
    async fn header_rejects_bad_magic() {
        let mut header = connection_header(None);
        header[0] = b'X';
        let mut src = header.as_slice();
        let err = read_connection_header(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn header_rejects_unknown_version() {
        let mut header = connection_header(None);
        header[4] = VERSION + 1;
        let mut src = header.as_slice();
        let err = read_connection_header(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn request_frame_layout() {
        let frame = request_frame(7, b"abc");
        assert_eq!(&frame[..4], &7i32.to_be_bytes());
        assert_eq!(&frame[4..8], &3i32.to_be_bytes());
        assert_eq!(&frame[8..], b"abc");
    }

    #[tokio::test]
    async fn inbound_roundtrip() {
        let frame = request_frame(42, b"payload");
        let mut src = frame.as_slice();
        let inbound = read_inbound(&mut src).await.unwrap();
        assert_eq!(
            inbound,
            Inbound::Request {
                call_id: 42,
                payload: b"payload".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn inbound_ping_is_bare() {
        let frame = PING_CALL_ID.to_be_bytes();
        let mut src = frame.as_slice();
        assert_eq!(read_inbound(&mut src).await.unwrap(), Inbound::Ping);
        assert!(src.is_empty());
    }

    #[tokio::test]
    async fn inbound_rejects_negative_call_id() {
        let frame = (-7i32).to_be_bytes();
        let mut src = frame.as_slice();
        let err = read_inbound(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn response_roundtrip_value() {
        let value = RawBytes(b"row-data".to_vec());
        let mut payload = Vec::new();
        value.write(&mut payload);

        let frame = response_frame(3, &payload);
        let mut src = frame.as_slice();

        let head = read_response_head(&mut src).await.unwrap();
        assert_eq!(head.call_id, 3);
        assert!(!head.is_error);
        assert_eq!(RawBytes::read(&mut src).await.unwrap(), value);
    }

    #[tokio::test]
    async fn response_roundtrip_error() {
        let frame = error_response_frame(9, "NotServingRegion", "region is offline");
        let mut src = frame.as_slice();

        let head = read_response_head(&mut src).await.unwrap();
        assert_eq!(head.call_id, 9);
        assert!(head.is_error);
        assert_eq!(read_string(&mut src).await.unwrap(), "NotServingRegion");
        assert_eq!(read_string(&mut src).await.unwrap(), "region is offline");
    }

    #[tokio::test]
    async fn response_rejects_bad_error_flag() {
        let mut frame = response_frame(1, &[]);
        frame[4] = 2;
        let mut src = frame.as_slice();
        let err = read_response_head(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn string_rejects_negative_length() {
        let mut frame = Vec::new();
        put_i32(&mut frame, -1);
        let mut src = frame.as_slice();
        let err = read_string(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn string_rejects_oversized_length() {
        let mut frame = Vec::new();
        put_i32(&mut frame, (MAX_PAYLOAD_SIZE + 1) as i32);
        let mut src = frame.as_slice();
        let err = read_string(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn raw_bytes_roundtrip() {
        let value = RawBytes((0..200u8).collect());
        let mut buf = Vec::new();
        value.write(&mut buf);

        let mut src = buf.as_slice();
        assert_eq!(RawBytes::read(&mut src).await.unwrap(), value);
        assert!(src.is_empty());
    }

    #[tokio::test]
    async fn raw_bytes_truncated_is_eof() {
        let value = RawBytes(vec![1, 2, 3, 4]);
        let mut buf = Vec::new();
        value.write(&mut buf);
        buf.truncate(buf.len() - 1);

        let mut src = buf.as_slice();
        let err = RawBytes::read(&mut src).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn ping_sentinel_is_negative_one() {
        assert_eq!(PING_CALL_ID, -1);
    }
}
