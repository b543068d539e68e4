//! Shared wire message types for tether agent communication
//!
//! One decoded unit of the line-oriented protocol is a [`Message`]: a call
//! request, a call response, or a notification. Both the client and test
//! agents depend on this crate so the two ends agree on framing.

mod protocol;

pub use protocol::{
    DecodeError, Message, RequestId, RpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
