//! everarch gateway archive - access to the archive through the `evr` tool
//!
//! This crate provides:
//! - Subprocess bridge: `evr` invocations as streams of stdout chunks
//! - Stream aggregation for single-response invocations
//! - The archive operations `watch`, `get_and_verify` and `sign_and_put`
//! - The claim set filter applied to watch streams

mod aggregate;
mod archive;
mod bridge;
mod error;
mod filter;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use aggregate::*;
pub use archive::*;
pub use bridge::*;
pub use error::*;
pub use filter::*;
