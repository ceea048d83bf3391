//! Upload intake: chunk sessions, assembly, validation and blob storage.

pub mod assembler;
pub mod chunk_store;
pub mod error;
pub mod kind;
pub mod naming;
pub mod storage;
pub mod validate;

pub use assembler::{Assembler, DirectUpload};
pub use chunk_store::ChunkStore;
pub use error::UploadError;
pub use kind::FileKind;
pub use storage::BlobStorage;
pub use validate::{validate, ValidationError};
