//! Proxy core: classification, signing, fetching, transforming, caching.

pub mod body;
pub mod cache;
pub mod dispatcher;
pub mod mime;
pub mod proxy;
pub mod s3_fetcher;
pub mod signer;
pub mod transform;
pub mod upstream;
pub mod url_fetcher;

#[cfg(test)]
pub mod test_support;
