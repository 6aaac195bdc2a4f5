//! Reliable stream encapsulation for the snapshot diff payload.
//!
//! Wire format:
//!
//! ```text
//! "reliable-encap"
//! { len:u32 | len bytes | sha256(all payload so far):32 }*   len <= 4 MiB
//! 0:u32 | sha256(all payload):32                             terminator
//! "reliable-end"
//! ```
//!
//! A sender that fails mid-stream writes `0xFFFF_FFFF | "reliable-err"` in
//! place of the next piece so the receiver can tell abort from truncation.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BackupError, Result};

/// Maximum payload bytes per piece.
pub const PIECE_SIZE: usize = 4 * 1024 * 1024;

pub const STREAM_MAGIC: &[u8; 14] = b"reliable-encap";

pub const STREAM_END: &[u8; 12] = b"reliable-end";

/// Same length as [`STREAM_END`] so the decoder can read either.
pub const STREAM_POISON: &[u8; 12] = b"reliable-err";

/// Length value announcing a poisoned stream instead of a piece.
pub const POISON_LENGTH: u32 = u32::MAX;

pub const DIGEST_LEN: usize = 32;

fn running_digest(hasher: &Sha256) -> [u8; DIGEST_LEN] {
    hasher.clone().finalize().into()
}

/// Short reads inside the encapsulation mean the stream was cut.
fn truncated(e: std::io::Error, what: &str) -> BackupError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BackupError::integrity(format!("Stream truncated while reading {}", what))
    } else {
        BackupError::Io(e)
    }
}

/// Read from `reader` until `buf` is full or the source is exhausted.
pub async fn fill_piece<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// =============================================================================
// Encoder
// =============================================================================

pub struct StreamEncoder<W> {
    writer: W,
    hasher: Sha256,
    bytes: u64,
    pieces: u64,
}

impl<W: AsyncWrite + Unpin> StreamEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            bytes: 0,
            pieces: 0,
        }
    }

    pub async fn write_start(&mut self) -> Result<()> {
        self.writer.write_all(STREAM_MAGIC).await?;
        Ok(())
    }

    /// Emit `data` as one or more pieces. Empty input writes nothing; only
    /// [`finish`](Self::finish) may emit the zero-length terminator.
    pub async fn write_piece(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(PIECE_SIZE) {
            self.emit(chunk).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.writer.write_u32(chunk.len() as u32).await?;
        self.writer.write_all(chunk).await?;
        self.writer.write_all(&running_digest(&self.hasher)).await?;
        self.bytes += chunk.len() as u64;
        self.pieces += 1;
        Ok(())
    }

    /// Terminator piece plus end sentinel. Returns payload bytes encoded.
    pub async fn finish(mut self) -> Result<u64> {
        self.emit(&[]).await?;
        self.writer.write_all(STREAM_END).await?;
        self.writer.flush().await?;
        tracing::debug!(
            "Encoded {} bytes in {} pieces, sha256 {}",
            self.bytes,
            self.pieces - 1,
            hex::encode(running_digest(&self.hasher))
        );
        Ok(self.bytes)
    }

    /// Tell the receiver the stream is being abandoned.
    pub async fn poison(mut self) -> Result<()> {
        self.writer.write_u32(POISON_LENGTH).await?;
        self.writer.write_all(STREAM_POISON).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn bytes_encoded(&self) -> u64 {
        self.bytes
    }
}

/// Encapsulate everything `reader` yields, using `piece_size` pieces.
///
/// A read error poisons the stream before it is returned.
pub async fn encode_stream_with<R, W>(reader: &mut R, writer: W, piece_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let piece_size = piece_size.clamp(1, PIECE_SIZE);
    let mut encoder = StreamEncoder::new(writer);
    encoder.write_start().await?;

    let mut buf = vec![0u8; piece_size];
    loop {
        match fill_piece(reader, &mut buf).await {
            Ok(0) => break,
            Ok(n) => encoder.write_piece(&buf[..n]).await?,
            Err(e) => {
                if let Err(poison_err) = encoder.poison().await {
                    tracing::warn!("Failed to poison stream: {}", poison_err);
                }
                return Err(e.into());
            }
        }
    }

    encoder.finish().await
}

pub async fn encode_stream<R, W>(reader: &mut R, writer: W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    encode_stream_with(reader, writer, PIECE_SIZE).await
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Body,
    Done,
}

pub struct StreamDecoder<R> {
    reader: R,
    hasher: Sha256,
    bytes: u64,
    state: DecodeState,
}

impl<R: AsyncRead + Unpin> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Sha256::new(),
            bytes: 0,
            state: DecodeState::Start,
        }
    }

    async fn read_start(&mut self) -> Result<()> {
        let mut magic = [0u8; STREAM_MAGIC.len()];
        self.reader
            .read_exact(&mut magic)
            .await
            .map_err(|e| truncated(e, "start sentinel"))?;
        if &magic != STREAM_MAGIC {
            return Err(BackupError::integrity("Stream start sentinel missing"));
        }
        self.state = DecodeState::Body;
        Ok(())
    }

    async fn read_end(&mut self) -> Result<()> {
        let mut end = [0u8; STREAM_END.len()];
        self.reader
            .read_exact(&mut end)
            .await
            .map_err(|e| truncated(e, "end sentinel"))?;
        if &end == STREAM_POISON {
            return Err(BackupError::integrity("Sender poisoned the stream"));
        }
        if &end != STREAM_END {
            return Err(BackupError::integrity("Stream end sentinel missing"));
        }
        self.state = DecodeState::Done;
        Ok(())
    }

    /// Next verified piece, or `None` once the terminator and end sentinel
    /// have been checked.
    pub async fn next_piece(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            DecodeState::Done => return Ok(None),
            DecodeState::Start => self.read_start().await?,
            DecodeState::Body => {}
        }

        let len = self
            .reader
            .read_u32()
            .await
            .map_err(|e| truncated(e, "piece length"))?;

        if len == POISON_LENGTH {
            let mut marker = [0u8; STREAM_POISON.len()];
            self.reader
                .read_exact(&mut marker)
                .await
                .map_err(|e| truncated(e, "poison sentinel"))?;
            if &marker != STREAM_POISON {
                return Err(BackupError::integrity(
                    "Piece length 0xFFFFFFFF without poison sentinel",
                ));
            }
            return Err(BackupError::integrity("Sender poisoned the stream"));
        }
        if len as usize > PIECE_SIZE {
            return Err(BackupError::integrity(format!(
                "Piece length {} exceeds {}",
                len, PIECE_SIZE
            )));
        }

        let mut piece = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut piece)
            .await
            .map_err(|e| truncated(e, "piece payload"))?;
        self.hasher.update(&piece);

        let mut digest = [0u8; DIGEST_LEN];
        self.reader
            .read_exact(&mut digest)
            .await
            .map_err(|e| truncated(e, "piece digest"))?;

        let expected = running_digest(&self.hasher);
        if digest != expected {
            return Err(BackupError::integrity(format!(
                "Hash mismatch after {} bytes: expected {}, got {}",
                self.bytes + len as u64,
                hex::encode(expected),
                hex::encode(digest)
            )));
        }

        if len == 0 {
            self.read_end().await?;
            return Ok(None);
        }

        self.bytes += len as u64;
        Ok(Some(Bytes::from(piece)))
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Decode a whole stream into `writer`. Returns payload bytes written.
pub async fn decode_stream<R, W>(reader: R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut decoder = StreamDecoder::new(reader);
    while let Some(piece) = decoder.next_piece().await? {
        writer.write_all(&piece).await?;
    }
    writer.flush().await?;
    Ok(decoder.bytes_decoded())
}
