//! Named density rasters that geometries weight into their placement density.

use meshgen_geom::Rect;

use crate::error::MeshGenError;

/// Affine world `(x, z)` to map `(u, v)` mapping; the map covers `u, v` in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapTransform {
    pub scale_x: f32,
    pub scale_z: f32,
    pub offset_x: f32,
    pub offset_z: f32,
}

impl MapTransform {
    pub const IDENTITY: MapTransform = MapTransform {
        scale_x: 1.0,
        scale_z: 1.0,
        offset_x: 0.0,
        offset_z: 0.0,
    };

    /// Stretch the map over `region`.
    pub fn covering(region: Rect) -> Self {
        let scale_x = if region.width() > 0.0 { 1.0 / region.width() } else { 0.0 };
        let scale_z = if region.depth() > 0.0 { 1.0 / region.depth() } else { 0.0 };
        Self {
            scale_x,
            scale_z,
            offset_x: -region.min_x * scale_x,
            offset_z: -region.min_z * scale_z,
        }
    }

    #[inline]
    pub fn apply(&self, x: f32, z: f32) -> (f32, f32) {
        (
            x * self.scale_x + self.offset_x,
            z * self.scale_z + self.offset_z,
        )
    }
}

impl Default for MapTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Greyscale raster sampled bilinearly; values are normalized to `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct DensityFactorMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
    world_to_map: MapTransform,
}

impl DensityFactorMap {
    /// Build from 8-bit luminance samples, row-major.
    pub fn from_luma(
        width: usize,
        height: usize,
        luma: &[u8],
        world_to_map: MapTransform,
    ) -> Result<Self, MeshGenError> {
        let mut map = Self {
            width: 0,
            height: 0,
            data: Vec::new(),
            world_to_map,
        };
        map.set_image(width, height, luma)?;
        Ok(map)
    }

    /// Replace the raster, keeping the transform.
    pub fn set_image(&mut self, width: usize, height: usize, luma: &[u8]) -> Result<(), MeshGenError> {
        if width == 0 || height == 0 || luma.len() != width * height {
            return Err(MeshGenError::InvalidRaster {
                width,
                height,
                len: luma.len(),
            });
        }
        self.width = width;
        self.height = height;
        self.data = luma.iter().map(|&v| f32::from(v) / 255.0).collect();
        Ok(())
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn world_to_map(&self) -> &MapTransform {
        &self.world_to_map
    }

    pub fn set_world_to_map(&mut self, transform: MapTransform) {
        self.world_to_map = transform;
    }

    /// Density at world `(x, z)`, clamped at the raster edges.
    pub fn density(&self, x: f32, z: f32) -> f32 {
        let (u, v) = self.world_to_map.apply(x, z);
        let fx = (u.clamp(0.0, 1.0) * (self.width - 1) as f32).max(0.0);
        let fz = (v.clamp(0.0, 1.0) * (self.height - 1) as f32).max(0.0);
        let x0 = (fx as usize).min(self.width - 1);
        let z0 = (fz as usize).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let z1 = (z0 + 1).min(self.height - 1);
        let tx = fx - x0 as f32;
        let tz = fz - z0 as f32;
        let at = |cx: usize, cz: usize| self.data[cz * self.width + cx];
        let top = at(x0, z0) + (at(x1, z0) - at(x0, z0)) * tx;
        let bottom = at(x0, z1) + (at(x1, z1) - at(x0, z1)) * tx;
        top + (bottom - top) * tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_raster() {
        let err = DensityFactorMap::from_luma(2, 2, &[0, 1, 2], MapTransform::IDENTITY).unwrap_err();
        assert!(matches!(err, MeshGenError::InvalidRaster { width: 2, height: 2, len: 3 }));
        assert!(DensityFactorMap::from_luma(0, 0, &[], MapTransform::IDENTITY).is_err());
    }

    #[test]
    fn samples_corners_and_interpolates() {
        let region = Rect::new(-10.0, -10.0, 10.0, 10.0);
        let map = DensityFactorMap::from_luma(2, 1, &[0, 255], MapTransform::covering(region)).unwrap();
        assert_eq!(map.density(-10.0, 0.0), 0.0);
        assert_eq!(map.density(10.0, 0.0), 1.0);
        assert!((map.density(0.0, 0.0) - 0.5).abs() < 1e-6);
        // clamped outside the region
        assert_eq!(map.density(50.0, 50.0), 1.0);
    }

    #[test]
    fn single_pixel_map_is_constant() {
        let map = DensityFactorMap::from_luma(1, 1, &[51], MapTransform::IDENTITY).unwrap();
        assert!((map.density(0.3, 0.9) - 0.2).abs() < 1e-6);
        assert!((map.density(-4.0, 7.0) - 0.2).abs() < 1e-6);
    }
}
