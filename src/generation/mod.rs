//! World generation pipeline
//!
//! A [`Pipeline`] is built once per world from the seed and the material
//! registry, then shared by every generation task. Stages run in order over
//! the same [`GeneratorControl`], each starting at the first block.

pub mod control;
pub mod stages;

pub use control::GeneratorControl;
pub use stages::{LayeredStage, TerrainParams, TerrainStage};

use glam::Vec3;
use log::{debug, trace};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::chunk::{CHUNK_SIDE, ChunkCoord};
use crate::voxel::material::{MaterialId, MaterialRegistry};

/// What a stage is asked to generate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationTask {
    pub coord: ChunkCoord,
    /// World position of the chunk's minimum corner
    pub origin: Vec3,
    pub seed: u64,
    pub chunk_world_size: f32,
}

impl GenerationTask {
    pub fn new(coord: ChunkCoord, seed: u64, chunk_world_size: f32) -> Self {
        Self {
            coord,
            origin: coord.world_origin(chunk_world_size),
            seed,
            chunk_world_size,
        }
    }

    /// Edge length of one block in world units
    pub fn block_size(&self) -> f32 {
        self.chunk_world_size / CHUNK_SIDE as f32
    }

    /// World position of the center of block (x, y, z)
    pub fn block_center(&self, x: usize, y: usize, z: usize) -> Vec3 {
        self.origin + (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * self.block_size()
    }
}

/// One step of chunk generation.
///
/// Stages hold no per-task state: `apply` takes `&self`, so identical
/// `(seed, coord)` always produce the same blocks.
pub trait GeneratorStage: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve materials and seed-dependent state. Called once per world.
    fn setup(&mut self, seed: u64, registry: &MaterialRegistry) -> Result<()>;

    fn apply(&self, task: &GenerationTask, control: &mut GeneratorControl) -> Result<()>;
}

/// Ordered list of stages shared by all generation tasks.
pub struct Pipeline {
    stages: Vec<Box<dyn GeneratorStage>>,
    seed: u64,
    chunk_world_size: f32,
}

impl Pipeline {
    /// Set up every stage against the world seed and registry.
    pub fn new(
        seed: u64,
        chunk_world_size: f32,
        registry: &MaterialRegistry,
        mut stages: Vec<Box<dyn GeneratorStage>>,
    ) -> Result<Self> {
        for stage in &mut stages {
            stage.setup(seed, registry)?;
            debug!("Generator stage '{}' ready", stage.name());
        }
        Ok(Self {
            stages,
            seed,
            chunk_world_size,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the stages for one chunk.
    pub fn generate(&self, coord: ChunkCoord) -> Result<Vec<MaterialId>> {
        let task = GenerationTask::new(coord, self.seed, self.chunk_world_size);
        let mut control = GeneratorControl::new();
        for stage in &self.stages {
            control.rewind();
            stage.apply(&task, &mut control).map_err(|e| match e {
                Error::Generation { .. } => e,
                other => Error::Generation {
                    coord,
                    reason: format!("stage '{}': {}", stage.name(), other),
                },
            })?;
            if control.pipeline_ended() {
                trace!("Stage '{}' ended the pipeline for {:?}", stage.name(), coord);
                break;
            }
        }
        Ok(control.into_blocks())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("seed", &self.seed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::chunk::CHUNK_VOLUME;
    use crate::voxel::material::EMPTY_MATERIAL;

    /// Fills everything with one material, optionally stopping the pipeline
    struct Fill {
        name: &'static str,
        material: String,
        id: MaterialId,
        stop: bool,
    }

    impl Fill {
        fn boxed(name: &'static str, material: &str, stop: bool) -> Box<dyn GeneratorStage> {
            Box::new(Self {
                name,
                material: material.to_string(),
                id: EMPTY_MATERIAL,
                stop,
            })
        }
    }

    impl GeneratorStage for Fill {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&mut self, _seed: u64, registry: &MaterialRegistry) -> Result<()> {
            self.id = registry.require(&self.material)?;
            Ok(())
        }

        fn apply(&self, _task: &GenerationTask, control: &mut GeneratorControl) -> Result<()> {
            assert_eq!(control.index(), 0, "cursor rewound before each stage");
            control.fill(self.id);
            if self.stop {
                control.end_pipeline();
            }
            Ok(())
        }
    }

    struct Broken;

    impl GeneratorStage for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn setup(&mut self, _seed: u64, _registry: &MaterialRegistry) -> Result<()> {
            Ok(())
        }

        fn apply(&self, _task: &GenerationTask, _control: &mut GeneratorControl) -> Result<()> {
            Err(Error::UnknownMaterial("test:missing".into()))
        }
    }

    fn registry() -> MaterialRegistry {
        MaterialRegistry::with_materials(["test:dirt", "test:stone"]).unwrap()
    }

    #[test]
    fn test_stages_run_in_order() {
        let registry = registry();
        let pipeline = Pipeline::new(
            1,
            16.0,
            &registry,
            vec![Fill::boxed("dirt", "test:dirt", false), Fill::boxed("stone", "test:stone", false)],
        )
        .unwrap();
        let blocks = pipeline.generate(ChunkCoord::new(0, 0, 0)).unwrap();
        assert_eq!(blocks, vec![registry.id("test:stone").unwrap(); CHUNK_VOLUME]);
    }

    #[test]
    fn test_end_pipeline_skips_later_stages() {
        let registry = registry();
        let pipeline = Pipeline::new(
            1,
            16.0,
            &registry,
            vec![Fill::boxed("dirt", "test:dirt", true), Fill::boxed("stone", "test:stone", false)],
        )
        .unwrap();
        let blocks = pipeline.generate(ChunkCoord::new(0, 0, 0)).unwrap();
        assert!(blocks.iter().all(|&b| b == registry.id("test:dirt").unwrap()));
    }

    #[test]
    fn test_setup_rejects_unknown_material() {
        let result = Pipeline::new(1, 16.0, &registry(), vec![Fill::boxed("x", "test:lava", false)]);
        assert!(matches!(result, Err(Error::UnknownMaterial(_))));
    }

    #[test]
    fn test_stage_failure_names_chunk() {
        let pipeline = Pipeline::new(1, 16.0, &registry(), vec![Box::new(Broken)]).unwrap();
        let coord = ChunkCoord::new(4, 5, 6);
        match pipeline.generate(coord) {
            Err(Error::Generation { coord: failed, reason }) => {
                assert_eq!(failed, coord);
                assert!(reason.contains("broken"));
            }
            other => panic!("expected generation error, got {:?}", other),
        }
    }

    #[test]
    fn test_task_geometry() {
        let task = GenerationTask::new(ChunkCoord::new(-1, 0, 2), 0, 16.0);
        assert_eq!(task.origin, Vec3::new(-16.0, 0.0, 32.0));
        assert_eq!(task.block_size(), 1.0);
        assert_eq!(task.block_center(0, 3, 0), Vec3::new(-15.5, 3.5, 32.5));
    }
}
