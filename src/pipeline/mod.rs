//! Message transformation pipeline: filter → clean → price → tag → album.

pub mod album;
pub mod language;
pub mod transformer;
pub mod types;

pub use album::AlbumBuffer;
pub use language::{LanguageProfile, LanguageTable};
pub use transformer::Transformer;
pub use types::{MediaRef, RawMessage, TransformedMessage};
