//! Backing-store contract: the revision algebra, the datastore traits the
//! proxy wraps, and the schema-change stream message types.

mod datastore;
mod revision;

pub use datastore::*;
pub use revision::*;
