//! Conference source bookkeeping
//!
//! Two layers, mirroring how the rest of the core consumes them: the
//! unchecked [`SourceMap`] supports add/remove/diff/copy and the pure
//! stripping transforms, and [`ValidatingSourceMap`] wraps it with the
//! invariant and limit checks every externally supplied edit must pass.

mod endpoint_set;
mod map;
mod validating;

pub use endpoint_set::EndpointSourceSet;
pub use map::{SourceMap, SourceMapDiff};
pub use validating::ValidatingSourceMap;
