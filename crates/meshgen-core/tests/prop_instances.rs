use std::sync::Arc;

use meshgen_core::testing::{FlatGround, RecordingFactory};
use meshgen_core::{GeometryLod, MeshGenError, MeshGenerator};
use meshgen_geom::{Aabb, Vec3};
use proptest::prelude::*;

fn generator(blocks: usize, min_draw: f32) -> MeshGenerator {
    let mut mg = MeshGenerator::new();
    mg.set_sample_box(Aabb::new(
        Vec3::new(0.0, -8.0, 0.0),
        Vec3::new(64.0, 8.0, 64.0),
    ))
    .unwrap();
    mg.set_cell_count(8).unwrap();
    mg.set_block_count(blocks);
    mg.add_ground_mesh(Arc::new(FlatGround::new(0.0)));
    let g = mg.create_geometry();
    mg.add_factory(g, RecordingFactory::new("near"), 6.0).unwrap();
    mg.add_factory(g, RecordingFactory::new("far"), 14.0).unwrap();
    let geom = mg.geometry_mut(g).unwrap();
    geom.set_radius(0.4);
    geom.set_density(0.08);
    geom.set_minimum_draw_distance(min_draw);
    mg
}

fn arb_walk() -> impl Strategy<Value = Vec<(f32, f32, f32)>> {
    prop::collection::vec((-10.0f32..74.0, -2.0f32..4.0, -10.0f32..74.0), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Back-references stay consistent whatever path the viewer takes
    #[test]
    fn instances_track_positions(walk in arb_walk(), blocks in 4usize..40, min_draw in 0.0f32..3.0) {
        let mut mg = generator(blocks, min_draw);
        for (x, y, z) in walk {
            let viewer = Vec3::new(x, y, z);
            match mg.update_for_position(viewer) {
                Ok(stats) => {
                    prop_assert!(stats.cells_in_range <= blocks);
                    prop_assert_eq!(stats.live_instances, mg.live_instances());
                }
                Err(MeshGenError::BlockBudgetExceeded { needed, max_blocks }) => {
                    prop_assert!(needed > max_blocks);
                    prop_assert_eq!(max_blocks, blocks);
                }
                Err(e) => {
                    prop_assert!(false, "unexpected error {}", e);
                }
            }
            prop_assert!(mg.pool_stats().in_use <= blocks);
            if let Err(e) = mg.validate() {
                prop_assert!(false, "{}", e);
            }
        }
    }

    // Every instanced position sits in its LOD band and inside the draw range
    #[test]
    fn instanced_positions_sit_in_their_band(walk in arb_walk(), min_draw in 0.0f32..3.0) {
        let mut mg = generator(64, min_draw);
        for (x, y, z) in walk {
            let viewer = Vec3::new(x, y, z);
            mg.update_for_position(viewer).unwrap();
            let geom = bands(&mg.geometries()[0]);
            for cid in 0..mg.grid().unwrap().len() {
                for p in mg.cell_positions(cid) {
                    let sq = viewer.distance_sq(p.position);
                    match p.instance {
                        Some(slot) => {
                            prop_assert!(sq < 14.0 * 14.0);
                            prop_assert!(sq >= min_draw * min_draw);
                            prop_assert_eq!(Some(slot.lod), lod_for(&geom, sq));
                        }
                        None => {
                            // Only cells in range are guaranteed to be instanced.
                            let cell = mg.grid().unwrap().cell(cid);
                            if cell.rect.distance_sq_to(viewer.xz()) <= 14.0 * 14.0 {
                                prop_assert!(
                                    sq >= 14.0 * 14.0 || lod_for(&geom, sq).is_none(),
                                    "uninstanced at sq {}", sq
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

// (squared minimum draw distance, squared LOD maxima)
fn bands(geom: &GeometryLod) -> (f32, Vec<f32>) {
    let min = geom.minimum_draw_distance();
    let maxima = geom
        .levels()
        .iter()
        .map(|l| l.max_distance() * l.max_distance())
        .collect();
    (min * min, maxima)
}

fn lod_for(bands: &(f32, Vec<f32>), sq: f32) -> Option<usize> {
    if sq < bands.0 {
        return None;
    }
    bands.1.iter().position(|&m| sq <= m)
}
