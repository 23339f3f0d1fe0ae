//! CLI command implementations.

pub mod cid;
pub mod decode;
pub mod subscribe;
