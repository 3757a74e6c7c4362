//! mirror-core: Platform-independent pieces of the directory mirror.
//!
//! This crate provides:
//! - Address parsing for `user[:password]@host[:port][:path]` destinations
//! - Lexical mapping between the local and remote sync roots
//! - RemoteTransport / RemoteSession trait abstractions
//! - The scp sink protocol encoder used to push single files
//! - The SyncEngine that turns watch events into remote actions

pub mod address;
pub mod engine;
pub mod events;
pub mod memory;
pub mod paths;
pub mod scp;
pub mod transport;

pub use address::{AddressError, RemoteAddress};
pub use engine::{EngineOptions, SyncCause, SyncEngine, SyncError, SyncStats};
pub use events::{WatchEvent, WatchEventKind};
pub use memory::InMemoryRemote;
pub use paths::{PathError, SyncRoot};
pub use scp::{TransferError, TransferHeader};
pub use transport::{PtySize, RemoteSession, RemoteTransport, SessionRequest, TransportError};
