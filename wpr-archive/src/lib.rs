//! Storage for recorded HTTP exchanges.
//!
//! A recording run appends [`Exchange`]s to a recording [`ArchiveStore`] and persists it once at
//! shutdown. A replay run loads the file into a frozen store that never changes afterwards.

mod codec;
mod error;
mod exchange;
pub mod inject;
mod signature;
mod store;

pub use codec::{MAGIC, VERSION};
pub use error::{ArchiveError, Result};
pub use exchange::{Exchange, RecordedResponse, Timing};
pub use inject::Injector;
pub use signature::{Scheme, Signature, SignatureBuilder, SIGNATURE_HEADERS};
pub use store::{check_writable, Archive, ArchiveOptions, ArchiveStore, Recorded};
