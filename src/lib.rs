//! # schema-proxy
//!
//! A revision-aware schema caching proxy that sits between a permissions
//! engine and a versioned schema store. The store holds two kinds of schema
//! definitions (namespaces and caveats), each rewritten at monotonically
//! advancing revisions; readers always read "as of" a revision. The proxy
//! keeps those reads off the backing store with two layered caches:
//!
//! - **Snapshot cache**: a byte-bounded map keyed by `(revision, name)` with
//!   single-flight coalescing of concurrent misses.
//! - **Watching cache**: a live, revision-indexed in-memory replica fed by the
//!   store's schema-change stream, serving reads at or below its checkpoint
//!   without touching the store and degrading to direct reads when the stream
//!   fails.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//!
//! use schema_proxy::cache::wrap_with_schema_cache;
//! use schema_proxy::config::SchemaProxyConfig;
//! # use schema_proxy::storage::SchemaDatastore;
//! # async fn demo(store: Arc<impl SchemaDatastore>) -> schema_proxy::Result<()> {
//! let config = SchemaProxyConfig::new()?;
//! let proxy = wrap_with_schema_cache(store, &config).await?;
//!
//! let reader = proxy.snapshot_reader(proxy.head_revision().await?);
//! let (namespace, last_written) = reader.read_namespace_by_name("document").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//! - **Revision**: an opaque totally-ordered stamp; the proxy only compares.
//! - **Checkpoint**: the highest revision the watching cache has fully
//!   observed from the stream; reads at or below it never hit the store.
//! - **Fallback mode**: degraded state after a stream failure in which every
//!   read consults the backing store while the worker re-subscribes.
//!
//! The cache is strictly in-memory and per-process: no durability, no
//! cross-process coherence, no write-through. Writes go to the store and the
//! cache learns of them through the watch stream.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod proto;
pub mod storage;

mod constants;
mod errors;

pub use errors::*;

//-----------------------------------------------------------
// Test utils
#[cfg(test)]
#[doc(hidden)]
pub mod test_utils;
