//! Email parsing: header decoding and MIME message decoding.

pub mod header;
pub mod mime;

pub use mime::{decode, decode_with_fallback};
