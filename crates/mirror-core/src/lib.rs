//! mirror-core: the pieces of the encrypted mirror with no IO policy.
//!
//! This crate provides:
//! - Content identity (SHA-256 over name and content)
//! - Per-file AES-256-CTR keys and the symmetric stream transform
//! - The `FileRecord` shape and the concurrent `MetadataStore`

pub mod crypto;
pub mod record;
pub mod store;

pub use crypto::{CryptoError, FileKey, Identity, IdentityHasher, Keystream, transform};
pub use record::{FileRecord, FileSummary, relative_name};
pub use store::MetadataStore;
