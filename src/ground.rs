use fastnoise_lite::{FastNoiseLite, NoiseType};
use meshgen_core::{BeamHit, GroundMesh, MaterialId};
use meshgen_geom::{Aabb, Vec3};

pub const SOIL: MaterialId = MaterialId(1);
pub const ROCK: MaterialId = MaterialId(2);

// Segment samples for beams that are not vertical.
const MARCH_STEPS: usize = 64;

/// Rolling heightfield `base + amplitude * noise(x, z)`; above `rock_line` the surface
/// reports rock.
pub struct NoiseGround {
    noise: FastNoiseLite,
    base: f32,
    amplitude: f32,
    rock_line: f32,
    bounds: Option<Aabb>,
}

impl NoiseGround {
    pub fn new(seed: i32, frequency: f32, base: f32, amplitude: f32) -> Self {
        let mut noise = FastNoiseLite::with_seed(seed);
        noise.set_noise_type(Some(NoiseType::OpenSimplex2));
        noise.set_frequency(Some(frequency));
        Self {
            noise,
            base,
            amplitude,
            rock_line: base + amplitude * 0.6,
            bounds: None,
        }
    }

    pub fn with_bounds(mut self, bounds: Aabb) -> Self {
        self.bounds = Some(bounds);
        self
    }

    #[inline]
    pub fn height(&self, x: f32, z: f32) -> f32 {
        self.base + self.amplitude * self.noise.get_noise_2d(x, z)
    }

    pub fn material_at(&self, y: f32) -> MaterialId {
        if y >= self.rock_line { ROCK } else { SOIL }
    }

    fn hit(&self, point: Vec3, want_material: bool) -> BeamHit {
        BeamHit {
            point,
            material: want_material.then(|| self.material_at(point.y)),
        }
    }
}

impl GroundMesh for NoiseGround {
    fn hit_beam(&self, start: Vec3, end: Vec3, want_material: bool) -> Option<BeamHit> {
        if start.x == end.x && start.z == end.z {
            let h = self.height(start.x, start.z);
            let (lo, hi) = (start.y.min(end.y), start.y.max(end.y));
            if h < lo || h > hi {
                return None;
            }
            return Some(self.hit(Vec3::new(start.x, h, start.z), want_material));
        }

        // March the segment and refine the first crossing linearly.
        let delta = end - start;
        let above = |p: Vec3| p.y - self.height(p.x, p.z);
        let mut prev = start;
        let mut prev_d = above(prev);
        for i in 1..=MARCH_STEPS {
            let p = start + delta * (i as f32 / MARCH_STEPS as f32);
            let d = above(p);
            if (prev_d >= 0.0) != (d >= 0.0) {
                let t = prev_d / (prev_d - d);
                let q = prev + (p - prev) * t;
                let y = self.height(q.x, q.z);
                return Some(self.hit(Vec3::new(q.x, y, q.z), want_material));
            }
            prev = p;
            prev_d = d;
        }
        None
    }

    fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertical_beam_lands_on_the_surface() {
        let g = NoiseGround::new(7, 0.02, 10.0, 4.0);
        let hit = g
            .hit_beam(Vec3::new(3.0, 50.0, -8.0), Vec3::new(3.0, -50.0, -8.0), false)
            .unwrap();
        assert_eq!(hit.point.y, g.height(3.0, -8.0));
        assert!(hit.material.is_none());
        assert!((6.0..=14.0).contains(&hit.point.y));
    }

    #[test]
    fn beam_above_the_surface_misses() {
        let g = NoiseGround::new(7, 0.02, 10.0, 4.0);
        assert!(
            g.hit_beam(Vec3::new(0.0, 50.0, 0.0), Vec3::new(0.0, 20.0, 0.0), true)
                .is_none()
        );
    }

    #[test]
    fn slanted_beam_finds_the_crossing() {
        let g = NoiseGround::new(11, 0.05, 0.0, 2.0);
        let hit = g
            .hit_beam(Vec3::new(0.0, 10.0, 0.0), Vec3::new(8.0, -10.0, 8.0), true)
            .unwrap();
        assert!((hit.point.y - g.height(hit.point.x, hit.point.z)).abs() < 1e-4);
        assert!(hit.material.is_some());
    }

    #[test]
    fn material_follows_the_rock_line() {
        let g = NoiseGround::new(1, 0.01, 0.0, 10.0);
        assert_eq!(g.material_at(-3.0), SOIL);
        assert_eq!(g.material_at(6.0), ROCK);
    }
}
