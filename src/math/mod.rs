//! Mathematical utilities and data structures

pub mod morton;

pub use morton::{MortonKey, decode_morton_3d, encode_morton_3d};
