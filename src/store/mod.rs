//! Compound key→element store.
//!
//! - [`segment`]: lock-striped map shards, each guarded by a [`KeyLock`](crate::sync::KeyLock)
//! - [`compound`]: the public store façade composing the memory tier and
//!   the disk overflow factory behind one API

pub(crate) mod compound;
pub(crate) mod segment;
