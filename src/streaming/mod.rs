//! Wire formats for a backup session.
//!
//! A session is a single bidirectional byte pipe. The client opens with the
//! magic number, the two sides trade control frames, and then the client
//! streams the snapshot diff wrapped in the reliable stream codec.
//!
//! # Architecture
//!
//! ```text
//! client                                          server
//!   | -- magic number --------------------------->  |
//!   | <----------------------------- GRAPH frame -- |
//!   | -- EDGE_INTENT frame ----------------------->  |
//!   | -- reliable-encap ... pieces ... reliable-end |
//!   | -- close write half ------------------------>  |
//! ```
//!
//! On the client the snapshot diff passes through a two-stage relay:
//!
//! ```text
//! +----------------+  bounded  +----------------+
//! | snapshot diff  | --------> | stream encoder | --> transport
//! | (btrfs send)   |  channel  |                |
//! +----------------+           +----------------+
//! ```

pub mod channel;
pub mod codec;
pub mod pipeline;
pub mod protocol;

pub use channel::{piece_channel, TransferStats, RELAY_CHANNEL_SIZE};
pub use codec::{
    decode_stream, encode_stream, StreamDecoder, StreamEncoder, PIECE_SIZE, STREAM_END,
    STREAM_MAGIC, STREAM_POISON,
};
pub use pipeline::SnapshotRelay;
pub use protocol::{
    read_frame, read_magic, read_message, write_frame, write_magic, write_message,
    ControlMessage, EdgeIntent, GraphDescriptor, MessageType, MAGIC_NUMBER,
};
