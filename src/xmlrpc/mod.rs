//! XML-RPC transport codec
//!
//! The subset of XML-RPC the CCU speaks: `methodCall`/`methodResponse`
//! envelopes, faults and the value types listed in [`value::Value`]. Basic
//! Auth lives in the HTTP layers, not here.

pub mod codec;
pub mod value;

pub use codec::{
    decode_call, decode_response, encode_call, encode_fault, encode_response, Fault, MethodCall,
    ResponseError,
};
pub use value::{Value, ValueKind};

