//! Transport layer.
//!
//! # Architecture
//!
//! - **Wire format**: `[4-byte length prefix as u32 big-endian] + [postcard frame]`
//! - **Multiplexing**: each frame carries a stream id; one TCP connection
//!   carries many concurrent calls
//! - **Payloads**: opaque bytes produced by a [`Codec`] chosen per call
//!
//! # Components
//!
//! - **[`Codec`]** / **[`FrameCodec`]**: payload and frame encoding
//! - **[`Connection`]** / **[`ClientStream`]**: dialing side
//! - **[`Server`]** / **[`ServerStream`]**: serving side

pub mod codec;
pub mod connection;
pub mod server;
pub mod tcp;

pub use codec::{Codec, FrameCodec};
pub use connection::{ClientStream, ConnState, Connection, DialOptions, DEFAULT_MAX_MSG_SIZE};
pub use server::{Server, ServerStream};
