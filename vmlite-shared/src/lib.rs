//! Types shared between the vmlite library and its tooling.

pub mod constants;
pub mod errors;

pub use errors::{VmliteError, VmliteResult};
