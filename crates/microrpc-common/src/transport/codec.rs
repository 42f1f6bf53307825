use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Frame;

/// Payload codec selected by the call's content subtype.
///
/// The transport never looks inside payloads; it only moves the bytes this
/// codec produces. New formats are added as variants.
///
/// # Example
///
/// ```
/// use microrpc_common::transport::Codec;
/// use serde_json::json;
///
/// let codec = Codec::from_subtype("json").unwrap();
/// let bytes = codec.marshal(&json!({"n": 42})).unwrap();
/// let back: serde_json::Value = codec.unmarshal(&bytes).unwrap();
/// assert_eq!(back["n"], 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Postcard,
}

impl Codec {
    /// Looks a codec up by content subtype (`json`, `postcard`).
    pub fn from_subtype(subtype: &str) -> Result<Self> {
        match subtype.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "postcard" => Ok(Codec::Postcard),
            other => Err(RpcError::InvalidConfig(format!(
                "unsupported content subtype '{}'",
                other
            ))),
        }
    }

    /// Looks a codec up by full content type (`application/json`).
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let subtype = content_type
            .rsplit(|c: char| c == '/' || c == '+')
            .next()
            .unwrap_or(content_type);
        Self::from_subtype(subtype)
    }

    pub fn subtype(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Postcard => "postcard",
        }
    }

    pub fn content_type(&self) -> String {
        format!("application/{}", self.subtype())
    }

    pub fn marshal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Postcard => Ok(postcard::to_allocvec(value)?),
        }
    }

    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::Postcard => Ok(postcard::from_bytes(data)?),
        }
    }
}

/// Encodes frames for the wire. Frames are always postcard, independent
/// of the payload codec.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(frame)?)
    }

    pub fn decode(data: &[u8]) -> Result<Frame> {
        Ok(postcard::from_bytes(data)?)
    }
}
