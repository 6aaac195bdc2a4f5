//! Channel types for the snapshot relay.
//!
//! Two-stage pipeline: snapshot reader -> encoder/transport writer.
//! Using a bounded channel for backpressure.

use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

/// Pieces buffered between the snapshot reader and the encoder.
/// Each holds up to one 4 MiB piece, so the relay caps out around 16 MiB.
pub const RELAY_CHANNEL_SIZE: usize = 4;

// =============================================================================
// Piece channel
// =============================================================================

/// A filled piece, or the read error that ended the snapshot stream.
pub type PieceResult = io::Result<Bytes>;

pub type PieceSender = mpsc::Sender<PieceResult>;

pub type PieceReceiver = mpsc::Receiver<PieceResult>;

/// Create a bounded channel for reader -> encoder communication
pub fn piece_channel() -> (PieceSender, PieceReceiver) {
    mpsc::channel(RELAY_CHANNEL_SIZE)
}

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one relayed snapshot stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes sent
    pub bytes: u64,

    /// Non-empty pieces sent
    pub pieces: u64,
}
