//! Shared protocol definitions for the `MeshChat` wire format.

pub mod codec;
pub mod message;
