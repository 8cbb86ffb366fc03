//! Internal building blocks (object model, pack, zlib) that the embedded backend is built on.

pub mod object;
pub mod pack;
pub mod zlib;
