//! Control messages exchanged before the snapshot stream.
//!
//! The client opens with an 8-byte magic number. After that every control
//! message is one frame on the Framed Channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BackupError, Result};
use crate::lineage::{Edge, Node, MAX_NODE_NAME_LEN};

/// Sent by the client before anything else; checked verbatim by the server.
pub const MAGIC_NUMBER: [u8; 8] = [0xa8, 0x5b, 0x4b, 0x2b, 0x1b, 0xf7, 0x4c, 0x0a];

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | body, where len counts type and body

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Graph = 0x01,
    EdgeIntent = 0x02,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Graph),
            0x02 => Some(Self::EdgeIntent),
            _ => None,
        }
    }
}

/// A message that travels as a single frame.
pub trait ControlMessage: Sized {
    const TYPE: MessageType;

    fn encode_body(&self, buf: &mut BytesMut);

    fn decode(body: Bytes) -> Result<Self>;

    /// Full frame: length, type byte, body.
    fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);

        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u32(1 + body.len() as u32);
        buf.put_u8(Self::TYPE as u8);
        buf.put_slice(&body);
        buf.freeze()
    }
}

/// Only node names go through here; `Node::new` caps them at
/// `MAX_NODE_NAME_LEN`, well inside the u16 prefix.
fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_NODE_NAME_LEN);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(BackupError::protocol(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(BackupError::protocol(format!("{} truncated", what)));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| BackupError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_edge(payload: &mut Bytes) -> Result<Edge> {
    let from = get_str(payload, "fromNode")?;
    let to = get_str(payload, "toNode")?;
    Edge::parse(&from, &to)
}

// =============================================================================
// GRAPH (0x01) - server -> client
// =============================================================================

/// Every edge stored in the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDescriptor {
    pub edges: Vec<Edge>,
}

impl ControlMessage for GraphDescriptor {
    const TYPE: MessageType = MessageType::Graph;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.edges.len() as u32);
        for edge in &self.edges {
            put_str(buf, edge.from.as_str());
            put_str(buf, edge.to.as_str());
        }
    }

    fn decode(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 4 {
            return Err(BackupError::protocol("Graph payload too short"));
        }
        let count = body.get_u32() as usize;
        // Each edge needs at least two string headers
        if count.saturating_mul(4) > body.remaining() {
            return Err(BackupError::protocol(format!(
                "Graph claims {} edges but only {} bytes follow",
                count,
                body.remaining()
            )));
        }

        let mut edges = Vec::with_capacity(count);
        for _ in 0..count {
            edges.push(get_edge(&mut body)?);
        }
        if body.has_remaining() {
            return Err(BackupError::protocol("Trailing bytes after graph"));
        }
        Ok(Self { edges })
    }
}

// =============================================================================
// EDGE_INTENT (0x02) - client -> server
// =============================================================================

/// The edge the client is about to stream. `from` is the root for a full
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeIntent {
    pub edge: Edge,
}

impl EdgeIntent {
    pub fn new(from: Node, to: Node) -> Self {
        Self {
            edge: Edge::new(from, to),
        }
    }
}

impl ControlMessage for EdgeIntent {
    const TYPE: MessageType = MessageType::EdgeIntent;

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.edge.from.as_str());
        put_str(buf, self.edge.to.as_str());
    }

    fn decode(mut body: Bytes) -> Result<Self> {
        let edge = get_edge(&mut body)?;
        if edge.to.is_root() {
            return Err(BackupError::protocol("Cannot store a backup named FULL"));
        }
        if body.has_remaining() {
            return Err(BackupError::protocol("Trailing bytes after edge intent"));
        }
        Ok(Self { edge })
    }
}

// =============================================================================
// Magic number
// =============================================================================

pub async fn write_magic<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&MAGIC_NUMBER).await?;
    Ok(())
}

/// Any mismatch, including a short read, is an integrity failure.
pub async fn read_magic<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let mut buf = [0u8; MAGIC_NUMBER.len()];
    match r.read_exact(&mut buf).await {
        Ok(_) if buf == MAGIC_NUMBER => Ok(()),
        Ok(_) => Err(BackupError::integrity(format!(
            "Invalid magic number {}",
            hex::encode(buf)
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BackupError::integrity("Connection closed before magic number"))
        }
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, body).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(BackupError::protocol(format!(
            "Frame size {} outside 1..={}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    let mut payload = Bytes::from(payload);
    let tag = payload.get_u8();
    let msg_type = MessageType::from_u8(tag)
        .ok_or_else(|| BackupError::protocol(format!("Unknown message type 0x{:02x}", tag)))?;

    Ok((msg_type, payload))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

/// Read one frame and decode it as `T`, rejecting any other message type.
pub async fn read_message<T, R>(r: &mut R) -> Result<T>
where
    T: ControlMessage,
    R: AsyncRead + Unpin,
{
    let (msg_type, body) = read_frame(r).await?;
    if msg_type != T::TYPE {
        return Err(BackupError::protocol(format!(
            "Expected {:?}, got {:?}",
            T::TYPE,
            msg_type
        )));
    }
    T::decode(body)
}

pub async fn write_message<T, W>(w: &mut W, msg: &T) -> Result<()>
where
    T: ControlMessage,
    W: AsyncWrite + Unpin,
{
    write_frame(w, &msg.encode()).await
}

// =============================================================================
// Tests
// =============================================================================
