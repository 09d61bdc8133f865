//! Evidence content storage and fingerprinted records

pub mod blob_store;
pub mod evidence_store;

pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use evidence_store::{EvidenceStore, EvidenceTxn, VerifyReport};
