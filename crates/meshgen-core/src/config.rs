use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use meshgen_geom::{Aabb, Vec2, Vec3};
use serde::Deserialize;

use crate::error::MeshGenError;
use crate::generator::{DEFAULT_BLOCK_COUNT, DEFAULT_CELL_COUNT, MeshGenerator};
use crate::scene::{MaterialId, MeshFactory};

#[derive(Clone, Debug, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub sample_box: Option<SampleBox>,
    #[serde(default = "default_cell_count")]
    pub cell_count: usize,
    #[serde(default = "default_block_count")]
    pub block_count: usize,
    #[serde(default = "default_density_factor")]
    pub default_density_factor: f32,
    #[serde(default)]
    pub density_scale: Option<DensityScaleConfig>,
    #[serde(default)]
    pub alpha_scale: Option<AlphaScaleConfig>,
    #[serde(default)]
    pub geometry: Vec<GeometryConfig>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            sample_box: None,
            cell_count: default_cell_count(),
            block_count: default_block_count(),
            default_density_factor: default_density_factor(),
            density_scale: None,
            alpha_scale: None,
            geometry: Vec::new(),
        }
    }
}

fn default_cell_count() -> usize {
    DEFAULT_CELL_COUNT
}
fn default_block_count() -> usize {
    DEFAULT_BLOCK_COUNT
}
fn default_density_factor() -> f32 {
    1.0
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct SampleBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl SampleBox {
    pub fn to_aabb(&self) -> Aabb {
        let [ax, ay, az] = self.min;
        let [bx, by, bz] = self.max;
        Aabb::new(Vec3::new(ax, ay, az), Vec3::new(bx, by, bz))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct DensityScaleConfig {
    pub min_dist: f32,
    pub max_dist: f32,
    #[serde(default)]
    pub max_factor: f32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct AlphaScaleConfig {
    pub min_dist: f32,
    pub max_dist: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GeometryConfig {
    #[serde(default)]
    pub radius: f32,
    #[serde(default = "default_geometry_density")]
    pub density: f32,
    #[serde(default)]
    pub min_draw_distance: f32,
    #[serde(default)]
    pub lod: Vec<LodConfig>,
    #[serde(default)]
    pub wind: Option<WindConfig>,
    #[serde(default)]
    pub density_factor_maps: Vec<FactorMapUse>,
    #[serde(default)]
    pub material_factors: Vec<MaterialFactor>,
    #[serde(default)]
    pub default_material_factor: f32,
    #[serde(default)]
    pub positions: Vec<[f32; 2]>,
}

fn default_geometry_density() -> f32 {
    1.0
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LodConfig {
    pub factory: String,
    pub max_distance: f32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct WindConfig {
    #[serde(default)]
    pub direction: [f32; 2],
    #[serde(default = "default_wind_bias")]
    pub bias: f32,
    #[serde(default = "default_wind_speed")]
    pub speed: f32,
}

fn default_wind_bias() -> f32 {
    1.0
}
fn default_wind_speed() -> f32 {
    1.0
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FactorMapUse {
    pub map: String,
    #[serde(default = "default_map_factor")]
    pub factor: f32,
}

fn default_map_factor() -> f32 {
    1.0
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct MaterialFactor {
    pub material: u32,
    pub factor: f32,
}

pub fn from_toml_str(s: &str) -> Result<GeneratorConfig, toml::de::Error> {
    toml::from_str(s)
}

pub fn load_config_from_path(path: &Path) -> Result<GeneratorConfig, Box<dyn Error>> {
    let s = fs::read_to_string(path)?;
    let cfg: GeneratorConfig = toml::from_str(&s)?;
    Ok(cfg)
}

impl MeshGenerator {
    /// Build a generator from `cfg`. Factory names are looked up through `resolve`.
    pub fn from_config<F>(cfg: &GeneratorConfig, resolve: F) -> Result<Self, MeshGenError>
    where
        F: FnMut(&str) -> Option<Arc<dyn MeshFactory>>,
    {
        let mut mg = MeshGenerator::new();
        mg.apply_config(cfg, resolve)?;
        Ok(mg)
    }

    /// Apply `cfg` on top of the current state, appending its geometries. Density factor
    /// maps named by the config must already be registered.
    pub fn apply_config<F>(&mut self, cfg: &GeneratorConfig, mut resolve: F) -> Result<(), MeshGenError>
    where
        F: FnMut(&str) -> Option<Arc<dyn MeshFactory>>,
    {
        if let Some(sample_box) = &cfg.sample_box {
            self.set_sample_box(sample_box.to_aabb())?;
        }
        self.set_cell_count(cfg.cell_count)?;
        self.set_block_count(cfg.block_count);
        self.set_default_density_factor(cfg.default_density_factor);
        if let Some(ds) = &cfg.density_scale {
            self.set_density_scale(ds.min_dist, ds.max_dist, ds.max_factor)?;
        }
        if let Some(a) = &cfg.alpha_scale {
            self.set_alpha_scale(a.min_dist, a.max_dist)?;
        }

        for gcfg in &cfg.geometry {
            // Resolve everything before creating the geometry so a bad name leaves no trace.
            let mut lods = Vec::with_capacity(gcfg.lod.len());
            for lod in &gcfg.lod {
                let factory = resolve(&lod.factory)
                    .ok_or_else(|| MeshGenError::UnknownFactory(lod.factory.clone()))?;
                lods.push((factory, lod.max_distance));
            }
            if let Some(missing) = gcfg
                .density_factor_maps
                .iter()
                .find(|m| !self.is_valid_density_factor_map(&m.map))
            {
                return Err(MeshGenError::UnknownDensityFactorMap(missing.map.clone()));
            }

            let id = self.create_geometry();
            for (factory, max_distance) in lods {
                self.add_factory(id, factory, max_distance)?;
            }
            for m in &gcfg.density_factor_maps {
                self.use_density_factor_map(id, &m.map, m.factor);
            }
            let g = self
                .geometry_mut(id)
                .ok_or(MeshGenError::UnknownGeometry(id.0))?;
            g.set_radius(gcfg.radius);
            g.set_density(gcfg.density);
            g.set_minimum_draw_distance(gcfg.min_draw_distance);
            if let Some(w) = &gcfg.wind {
                g.set_wind_direction(w.direction[0], w.direction[1]);
                g.set_wind_bias(w.bias);
                g.set_wind_speed(w.speed);
            }
            for mf in &gcfg.material_factors {
                g.add_density_material_factor(MaterialId(mf.material), mf.factor);
            }
            g.set_default_density_material_factor(gcfg.default_material_factor);
            for &[x, z] in &gcfg.positions {
                g.add_position(Vec2::new(x, z));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingFactory;

    const DOC: &str = r#"
cell_count = 8
block_count = 40

[sample_box]
min = [0.0, -5.0, 0.0]
max = [80.0, 5.0, 80.0]

[density_scale]
min_dist = 10.0
max_dist = 30.0
max_factor = 0.25

[[geometry]]
radius = 0.5
density = 0.1
min_draw_distance = 1.0
positions = [[4.0, 4.0]]
material_factors = [{ material = 2, factor = 0.5 }]

[geometry.wind]
direction = [1.0, 0.0]
speed = 2.0

[[geometry.lod]]
factory = "far"
max_distance = 30.0

[[geometry.lod]]
factory = "near"
max_distance = 10.0
"#;

    fn resolver(name: &str) -> Option<Arc<dyn MeshFactory>> {
        let factory: Arc<dyn MeshFactory> = match name {
            "near" | "far" => RecordingFactory::new(name),
            _ => return None,
        };
        Some(factory)
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = from_toml_str("").unwrap();
        assert_eq!(cfg.cell_count, DEFAULT_CELL_COUNT);
        assert_eq!(cfg.block_count, DEFAULT_BLOCK_COUNT);
        assert_eq!(cfg.default_density_factor, 1.0);
        assert!(cfg.sample_box.is_none());
        assert!(cfg.geometry.is_empty());
    }

    #[test]
    fn applies_full_document() {
        let cfg = from_toml_str(DOC).unwrap();
        let mg = MeshGenerator::from_config(&cfg, resolver).unwrap();
        assert_eq!(mg.cell_count(), 8);
        assert_eq!(mg.block_count(), 40);
        assert_eq!(mg.geometry_count(), 1);
        let g = mg.geometry(crate::GeometryId(0)).unwrap();
        let lods: Vec<f32> = g.levels().iter().map(|l| l.max_distance()).collect();
        assert_eq!(lods, vec![10.0, 30.0]);
        assert_eq!(g.radius(), 0.5);
        assert_eq!(g.minimum_draw_distance(), 1.0);
        assert_eq!(g.wind_data(), Vec3::new(2.0, 0.0, 1.0));
        assert_eq!(g.manual_positions(), &[Vec2::new(4.0, 4.0)]);
        assert_eq!(g.material_factor(Some(MaterialId(2))), 0.5);
        assert_eq!(g.material_factor(None), 0.0);
        assert_eq!(mg.total_max_dist(), 30.0);
    }

    #[test]
    fn unknown_names_are_reported() {
        let mut cfg = from_toml_str(DOC).unwrap();
        cfg.geometry[0].lod[0].factory = "missing".into();
        let err = MeshGenerator::from_config(&cfg, resolver).unwrap_err();
        assert_eq!(err, MeshGenError::UnknownFactory("missing".into()));

        let mut cfg = from_toml_str(DOC).unwrap();
        cfg.geometry[0].density_factor_maps.push(FactorMapUse {
            map: "paths".into(),
            factor: 1.0,
        });
        let err = MeshGenerator::from_config(&cfg, resolver).unwrap_err();
        assert_eq!(err, MeshGenError::UnknownDensityFactorMap("paths".into()));
    }

    #[test]
    fn bad_values_surface_as_errors() {
        let cfg = from_toml_str("cell_count = 0").unwrap();
        assert_eq!(
            MeshGenerator::from_config(&cfg, resolver).unwrap_err(),
            MeshGenError::InvalidCellCount(0)
        );
        assert!(from_toml_str("cell_count = \"many\"").is_err());
    }
}
