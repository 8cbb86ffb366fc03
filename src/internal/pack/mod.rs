//! Pack file decoding, encoding and random access that follow the
//! [pack-format spec](https://git-scm.com/docs/pack-format).

pub mod decode;
pub mod encode;
pub mod entry;
pub mod pack_index;
pub mod packfile;
