//! Request-scoped data carried through dispatch, fetch and transform.
//!
//! Nothing here outlives a request except `CachedResponse`, which is what
//! the cache store keeps.

pub mod cached;
pub mod params;
pub mod request;
pub mod selection;
pub mod upstream;
