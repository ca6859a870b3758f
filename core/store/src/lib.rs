//! Local store abstraction for notesync.
//!
//! The sync engine reads and writes client-side state only through the
//! [`LocalStore`] trait: cached note/workspace projections, the pending
//! operation queue, and the persisted last-sync time and backoff counter.
//!
//! Two implementations ship here: [`MemoryStore`] for tests and embedding,
//! and [`SqliteStore`] for durable storage.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::LocalStore;
