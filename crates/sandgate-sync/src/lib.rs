//! sandgate-sync — durability for the backend's ephemeral local state.
//!
//! Each manifest entry maps a local directory to a prefix in an object
//! store. A JSON **marker** object records the last successful sync of an
//! entry; markers are explicit because the store is assumed to carry no
//! usable timestamp metadata.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine
//!   ├── restore()  remote marker newer (or no local marker)
//!   │               → download prefix additively → write local marker
//!   ├── backup()   reconcile first, then if the tree digest changed
//!   │               → upload every file → remote marker → local marker
//!   └── ObjectStore (S3 / local directory / in-memory)
//!
//! BackupScheduler
//!   └── fixed interval → backup() under a per-tick timeout
//! ```
//!
//! Nothing here ever deletes: restore leaves local-only files alone and
//! backup never removes remote objects. Failures are reported per entry
//! and retried on the next tick.

pub mod engine;
pub mod error;
pub mod manifest;
pub mod scheduler;
pub mod store;
pub mod tree;

pub use engine::{BackupOutcome, EntryStatus, RestoreOutcome, SyncEngine, SyncReport};
pub use error::{StoreError, SyncError};
pub use manifest::{ManifestEntry, Marker, SyncManifest, MARKER_NAME};
pub use scheduler::BackupScheduler;
pub use store::{LocalDirStore, MemoryStore, ObjectStore, S3Store};
