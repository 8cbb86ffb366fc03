//! Git delta instructions as found in `OFS_DELTA` and `REF_DELTA` pack entries.
//!
//! Only reconstruction is needed here: pushed packs and on-disk packs may contain deltas, while
//! packs produced for fetches are always written undeltified.

pub mod decode;
pub mod errors;
pub mod utils;

pub use decode::delta_decode;
