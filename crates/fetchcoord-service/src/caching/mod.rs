//! # In-memory object caching
//!
//! Decoded objects are kept in a bounded [`ObjectCache`] keyed by their URL. Every object carries a
//! cost, usually the size of the bytes it was decoded from, and the sum of all costs never exceeds
//! the configured capacity. Inserting into a full cache evicts the least recently used entries
//! until the new one fits, and an object that alone exceeds the capacity is not cached at all.
//!
//! The cache can be emptied at any time by a [`MemoryPressure`] signal. Clearing only ever touches
//! the cache itself, never the bookkeeping of fetches that are currently in flight, so it is safe
//! to do concurrently with anything else.
//!
//! There is no negative caching: failed fetches and objects that failed to decode are simply not
//! cached, and the next request for the same URL fetches again.

mod memory;
mod pressure;

pub use memory::ObjectCache;
pub use pressure::MemoryPressure;
