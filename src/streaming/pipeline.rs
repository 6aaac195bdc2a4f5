//! Snapshot relay pipeline.
//!
//! Moves the diff stream from the snapshot sender, through the encoder, onto
//! the transport. The reader and the writer run as two stages of one task
//! joined by a bounded channel, so a stalled transport stalls the reader
//! instead of buffering without limit.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::streaming::channel::{piece_channel, PieceReceiver, PieceSender, TransferStats};
use crate::streaming::codec::{fill_piece, StreamEncoder, PIECE_SIZE};

/// Relay configuration
pub struct SnapshotRelay {
    piece_size: usize,
}

impl Default for SnapshotRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotRelay {
    pub fn new() -> Self {
        Self {
            piece_size: PIECE_SIZE,
        }
    }

    /// Smaller pieces, mostly for tests. Clamped to `1..=PIECE_SIZE`.
    pub fn with_piece_size(piece_size: usize) -> Self {
        Self {
            piece_size: piece_size.clamp(1, PIECE_SIZE),
        }
    }

    /// Relay everything `source` yields as pieces on `encoder`.
    ///
    /// Writes neither the start nor the end of the stream: the caller decides
    /// between [`StreamEncoder::finish`] and [`StreamEncoder::poison`] once it
    /// knows whether the source exited cleanly. A writer error cancels the
    /// reader stage.
    pub async fn run<R, W>(
        &self,
        source: &mut R,
        encoder: &mut StreamEncoder<W>,
    ) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin,
    {
        let (tx, rx) = piece_channel();

        let producer = read_pieces(source, tx, self.piece_size);
        let consumer = encode_pieces(rx, encoder);
        tokio::pin!(producer, consumer);

        tokio::select! {
            result = &mut consumer => result,
            () = &mut producer => consumer.await,
        }
    }

    /// A complete stream: start sentinel, pieces, then the end sentinel, or
    /// the poison marker if `source` fails.
    pub async fn run_to_end<R, W>(&self, source: &mut R, writer: W) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin,
    {
        let mut encoder = StreamEncoder::new(writer);
        encoder.write_start().await?;

        match self.run(source, &mut encoder).await {
            Ok(stats) => {
                encoder.finish().await?;
                Ok(stats)
            }
            Err(e) => {
                if let Err(poison_err) = encoder.poison().await {
                    tracing::warn!("Failed to poison stream: {}", poison_err);
                }
                Err(e)
            }
        }
    }
}

/// Reader stage: fill pieces and hand them to the encoder.
async fn read_pieces<R>(source: &mut R, tx: PieceSender, piece_size: usize)
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let mut buf = BytesMut::zeroed(piece_size);
        match fill_piece(source, &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                if tx.send(Ok(buf.freeze())).await.is_err() {
                    // Encoder stage is gone; it reports its own error
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Writer stage: encode pieces until the reader hangs up.
async fn encode_pieces<W>(
    mut rx: PieceReceiver,
    encoder: &mut StreamEncoder<W>,
) -> Result<TransferStats>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = TransferStats::default();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(piece) => {
                encoder.write_piece(&piece).await?;
                stats.bytes += piece.len() as u64;
                stats.pieces += 1;
            }
            Err(e) => {
                tracing::warn!("Snapshot stream failed after {} bytes: {}", stats.bytes, e);
                return Err(e.into());
            }
        }
    }
    Ok(stats)
}
