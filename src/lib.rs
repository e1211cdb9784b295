//! Domain core of confighub: versioned configuration content, structural
//! diffs, gray release rules and request signing.
//!
//! Nothing in this crate performs I/O. Persistence, fan-out and the HTTP
//! surface live in `confighub-cli`.

pub mod content;
pub mod diff;
pub mod error;
pub mod gray;
pub mod model;
pub mod signature;

pub use content::{content_hash, normalize, short_hash};
pub use diff::{diff_values, Change, ChangeKind};
pub use error::{Error, Result};
pub use gray::GrayRule;
pub use model::{
    AccessKey, Capability, ChangeEvent, ChangeType, Document, DocumentKey, FileType, NewRelease,
    NewVersion, Permissions, Release, ReleaseStatus, ReleaseType, Version,
};
