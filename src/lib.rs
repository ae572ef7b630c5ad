//! Terra - streaming sparse voxel world storage

pub mod core;
pub mod math;
pub mod voxel;
pub mod streaming;
pub mod generation;
pub mod world;

pub use world::{World, WorldBuilder};
