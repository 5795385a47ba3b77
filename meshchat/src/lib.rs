//! `MeshChat`: infrastructure-less flooding chat library.

pub mod config;
pub mod engine;
pub mod node;
pub mod transport;
