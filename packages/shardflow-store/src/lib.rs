//! shardflow-store - Content-addressable artifact storage
//!
//! Intermediate files produced by a pipeline run are kept as immutable,
//! content-addressed artifacts and passed between jobs as opaque handles.
//!
//! ## Core Principles
//!
//! 1. **Immutability**: an artifact is never mutated after creation; it is
//!    destroyed only by explicit garbage collection at pipeline teardown.
//! 2. **Content addressing**: the handle is derived from the bytes, so
//!    identical content converges on one object and re-ingest is idempotent.
//! 3. **Append-only layout**: concurrent reads and writes of distinct
//!    handles are safe without coordination.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shardflow_store::ArtifactStore;
//!
//! let store = ArtifactStore::open("/var/run/shardflow/store").await?;
//!
//! // Ingest the run input once at start
//! let input = store.import_file("genome.txt").await?;
//!
//! // Jobs exchange handles, never paths
//! let piece = store.write_bytes(b">rec1\ndata\n").await?;
//!
//! // Reduce-side reassembly, byte-exact in the given order
//! let merged = store.concatenate(&[piece.clone(), piece]).await?;
//!
//! // Export the final artifact once at completion
//! store.export_file(&merged, "masked.txt").await?;
//! ```

pub mod error;
pub mod handle;
pub mod store;

pub use error::{ErrorKind, Result, StoreError};
pub use handle::ArtifactHandle;
pub use store::ArtifactStore;
