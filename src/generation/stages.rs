//! Built-in generator stages

use log::debug;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::generation::{GenerationTask, GeneratorControl, GeneratorStage};
use crate::voxel::chunk::CHUNK_SIDE;
use crate::voxel::material::{MaterialId, MaterialRegistry};

/// Fills blocks by world height: each band covers everything below its top
/// and above the previous band's top. Blocks above the last band are left
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct LayeredStage {
    bands: Vec<(f32, String)>,
    resolved: Vec<(f32, MaterialId)>,
}

impl LayeredStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a band ending (exclusive) at world height `top`.
    pub fn band(mut self, top: f32, material: impl Into<String>) -> Self {
        self.bands.push((top, material.into()));
        self.bands.sort_by(|a, b| a.0.total_cmp(&b.0));
        self
    }

    fn material_at(&self, y: f32) -> Option<MaterialId> {
        self.resolved.iter().find(|(top, _)| y < *top).map(|&(_, id)| id)
    }
}

impl GeneratorStage for LayeredStage {
    fn name(&self) -> &str {
        "layered"
    }

    fn setup(&mut self, _seed: u64, registry: &MaterialRegistry) -> Result<()> {
        self.resolved = self
            .bands
            .iter()
            .map(|(top, name)| Ok((*top, registry.require(name)?)))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn apply(&self, task: &GenerationTask, control: &mut GeneratorControl) -> Result<()> {
        let row = CHUNK_SIDE;
        for _z in 0..CHUNK_SIDE {
            for y in 0..CHUNK_SIDE {
                let world_y = task.block_center(0, y, 0).y;
                match self.material_at(world_y) {
                    Some(material) => {
                        for _x in 0..row {
                            control.write(material);
                            control.next();
                        }
                    }
                    None => control.skip(row),
                }
            }
        }
        Ok(())
    }
}

/// Height field parameters for [`TerrainStage`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainParams {
    /// Horizontal scale (larger = smoother)
    pub scale: f32,
    /// Height range above `base_height`
    pub height_scale: f32,
    pub base_height: f32,
    /// FBM octaves
    pub octaves: u32,
    pub persistence: f32,
    pub lacunarity: f32,
    /// Thickness of the surface layer in world units
    pub surface_depth: f32,
    /// Thickness of the layer below the surface
    pub subsurface_depth: f32,
    pub surface: String,
    pub subsurface: String,
    pub deep: String,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            scale: 100.0,
            height_scale: 64.0,
            base_height: 0.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            surface_depth: 1.0,
            subsurface_depth: 4.0,
            surface: "base:grass".into(),
            subsurface: "base:dirt".into(),
            deep: "base:stone".into(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TerrainMaterials {
    surface: MaterialId,
    subsurface: MaterialId,
    deep: MaterialId,
}

/// Fractal Perlin height field: surface, subsurface and deep materials
/// below the terrain height; everything above is left untouched.
pub struct TerrainStage {
    params: TerrainParams,
    noise: Option<Fbm<Perlin>>,
    materials: Option<TerrainMaterials>,
}

impl TerrainStage {
    pub fn new(params: TerrainParams) -> Self {
        Self {
            params,
            noise: None,
            materials: None,
        }
    }

    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Terrain height at world (x, z). Zero before `setup`.
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let Some(noise) = &self.noise else {
            return 0.0;
        };
        let nx = (x / self.params.scale) as f64;
        let nz = (z / self.params.scale) as f64;

        // [-1, 1] → [0, height_scale]
        let normalized = (noise.get([nx, nz]) + 1.0) / 2.0;
        self.params.base_height + (normalized * self.params.height_scale as f64) as f32
    }

    fn material_for_depth(materials: &TerrainMaterials, params: &TerrainParams, depth: f32) -> MaterialId {
        if depth < params.surface_depth {
            materials.surface
        } else if depth < params.surface_depth + params.subsurface_depth {
            materials.subsurface
        } else {
            materials.deep
        }
    }
}

impl GeneratorStage for TerrainStage {
    fn name(&self) -> &str {
        "terrain"
    }

    fn setup(&mut self, seed: u64, registry: &MaterialRegistry) -> Result<()> {
        // noise seeds are 32-bit; fold the world seed
        let folded = (seed ^ (seed >> 32)) as u32;
        self.noise = Some(
            Fbm::<Perlin>::new(folded)
                .set_octaves(self.params.octaves as usize)
                .set_persistence(self.params.persistence as f64)
                .set_lacunarity(self.params.lacunarity as f64),
        );
        self.materials = Some(TerrainMaterials {
            surface: registry.require(&self.params.surface)?,
            subsurface: registry.require(&self.params.subsurface)?,
            deep: registry.require(&self.params.deep)?,
        });
        debug!(
            "Terrain stage: seed {}, {} octaves, heights {}..{}",
            folded,
            self.params.octaves,
            self.params.base_height,
            self.params.base_height + self.params.height_scale
        );
        Ok(())
    }

    fn apply(&self, task: &GenerationTask, control: &mut GeneratorControl) -> Result<()> {
        let materials = self
            .materials
            .as_ref()
            .ok_or_else(|| Error::Generation {
                coord: task.coord,
                reason: "terrain stage used before setup".into(),
            })?;

        let mut heights = [0.0f32; CHUNK_SIDE * CHUNK_SIDE];
        for z in 0..CHUNK_SIDE {
            for x in 0..CHUNK_SIDE {
                let p = task.block_center(x, 0, z);
                heights[x + z * CHUNK_SIDE] = self.height_at(p.x, p.z);
            }
        }

        // Entirely above ground: nothing to write
        let chunk_bottom = task.origin.y;
        if heights.iter().all(|&h| h <= chunk_bottom) {
            return Ok(());
        }

        for z in 0..CHUNK_SIDE {
            for y in 0..CHUNK_SIDE {
                let world_y = task.block_center(0, y, 0).y;
                for x in 0..CHUNK_SIDE {
                    let depth = heights[x + z * CHUNK_SIDE] - world_y;
                    if depth > 0.0 {
                        control.write(Self::material_for_depth(materials, &self.params, depth));
                    }
                    control.next();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Pipeline;
    use crate::voxel::chunk::{CHUNK_VOLUME, ChunkCoord, block_index};
    use crate::voxel::material::EMPTY_MATERIAL;

    fn registry() -> MaterialRegistry {
        MaterialRegistry::with_materials(["base:grass", "base:dirt", "base:stone"]).unwrap()
    }

    #[test]
    fn test_layered_bands() {
        let registry = registry();
        let stage = LayeredStage::new().band(8.0, "base:dirt").band(4.0, "base:stone");
        let pipeline = Pipeline::new(0, 16.0, &registry, vec![Box::new(stage)]).unwrap();
        let blocks = pipeline.generate(ChunkCoord::new(0, 0, 0)).unwrap();

        let stone = registry.id("base:stone").unwrap();
        let dirt = registry.id("base:dirt").unwrap();
        assert_eq!(blocks[block_index(3, 0, 9)], stone);
        assert_eq!(blocks[block_index(3, 3, 9)], stone);
        assert_eq!(blocks[block_index(3, 4, 9)], dirt);
        assert_eq!(blocks[block_index(3, 7, 9)], dirt);
        assert_eq!(blocks[block_index(3, 8, 9)], EMPTY_MATERIAL);
    }

    #[test]
    fn test_layered_unknown_material() {
        let mut stage = LayeredStage::new().band(1.0, "base:lava");
        assert!(matches!(stage.setup(0, &registry()), Err(Error::UnknownMaterial(_))));
    }

    #[test]
    fn test_terrain_is_deterministic() {
        let registry = registry();
        let build = || {
            Pipeline::new(42, 16.0, &registry, vec![Box::new(TerrainStage::new(TerrainParams::default()))])
                .unwrap()
        };
        let a = build().generate(ChunkCoord::new(1, 1, -2)).unwrap();
        let b = build().generate(ChunkCoord::new(1, 1, -2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_terrain_sky_and_bedrock() {
        let registry = registry();
        let params = TerrainParams {
            base_height: 0.0,
            height_scale: 32.0,
            ..Default::default()
        };
        let pipeline =
            Pipeline::new(7, 16.0, &registry, vec![Box::new(TerrainStage::new(params))]).unwrap();

        let sky = pipeline.generate(ChunkCoord::new(0, 10, 0)).unwrap();
        assert_eq!(sky, vec![EMPTY_MATERIAL; CHUNK_VOLUME]);

        let deep = pipeline.generate(ChunkCoord::new(0, -4, 0)).unwrap();
        let stone = registry.id("base:stone").unwrap();
        assert!(deep.iter().all(|&b| b == stone));
    }

    #[test]
    fn test_terrain_layers_from_top() {
        let registry = registry();
        let mut stage = TerrainStage::new(TerrainParams::default());
        stage.setup(3, &registry).unwrap();
        let h = stage.height_at(0.5, 0.5);
        assert!((0.0..=64.0).contains(&h));

        let chunk_y = (h / 16.0).floor() as i32;
        let pipeline = Pipeline::new(3, 16.0, &registry, vec![Box::new(stage)]).unwrap();
        let blocks = pipeline.generate(ChunkCoord::new(0, chunk_y, 0)).unwrap();

        // Column (0, _, 0) is grass right below the surface, air above it
        let local_top = (h - chunk_y as f32 * 16.0 - 0.5).floor();
        if local_top >= 0.0 && local_top < 15.0 {
            let top = local_top as usize;
            assert_eq!(blocks[block_index(0, top, 0)], registry.id("base:grass").unwrap());
            assert_eq!(blocks[block_index(0, top + 1, 0)], EMPTY_MATERIAL);
        }
    }
}
