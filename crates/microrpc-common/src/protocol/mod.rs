pub mod error;
pub mod frame;
pub mod metadata;

pub use error::{Result, RpcError};
pub use frame::{Frame, StreamId};
pub use metadata::{
    Metadata, CONTENT_TYPE, FROM_SERVICE_HEADER, REQUEST_ID_HEADER, SERVICE_HEADER,
};
