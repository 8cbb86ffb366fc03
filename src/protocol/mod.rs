//! The git smart protocol and its two transports.
//!
//! [`pktline`] and [`utils`] are the wire codec, [`smart`] is the per-request session state
//! machine, and [`ssh`] and [`http`] adapt it to their transports. Repository lookup and access
//! control are reached only through the interfaces in [`core`].
pub mod core;
pub mod http;
pub mod pktline;
pub mod smart;
pub mod ssh;
pub mod types;
pub mod utils;

pub use core::{AccessPolicy, AllowAll, Identity, RepositoryResolver, StorageResolver};
pub use smart::{SessionState, TransportSession};
pub use types::*;
