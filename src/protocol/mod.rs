//! The binary wire protocol: primitive encodings, per-API message schemas,
//! framing, and the message-set format with its compression envelopes.

pub mod api_key;
pub mod api_version;
pub mod error;
pub mod frame;
pub mod messages;
pub mod primitives;
pub mod record;
#[cfg(test)]
mod test_utils;
pub mod traits;
