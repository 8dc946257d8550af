use meshgen_geom::{Mat3, Vec3};

use crate::position::PositionRef;

/// Packed 3x4 row-major instance transform; the last column is the translation relative to
/// the batch anchor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InstanceTransform {
    pub m: [f32; 12],
}

impl InstanceTransform {
    pub fn new(rotation: &Mat3, translation: Vec3) -> Self {
        let r = &rotation.m;
        Self {
            m: [
                r[0][0],
                r[0][1],
                r[0][2],
                translation.x,
                r[1][0],
                r[1][1],
                r[1][2],
                translation.y,
                r[2][0],
                r[2][1],
                r[2][2],
                translation.z,
            ],
        }
    }

    #[inline]
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.m[3], self.m[7], self.m[11])
    }
}

/// Per-instance shader data next to the transform.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InstanceExtra {
    pub random: f32,
    pub fade_opaque_dist: f32,
    pub fade_dist_scale: f32,
}

/// Result of a swap-remove that moved another instance into the vacated slot.
///
/// The owner's `InstanceSlot::index` must be rewritten from `from` to `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "the moved owner's back-reference has to be patched"]
pub struct Relocation {
    pub owner: PositionRef,
    pub from: usize,
    pub to: usize,
}

/// Parallel per-instance arrays of one LOD level. Index `i` of every array describes the same
/// instance; removal swaps the last instance into the hole.
#[derive(Clone, Debug, Default)]
pub struct InstanceArrays {
    owners: Vec<PositionRef>,
    transforms: Vec<InstanceTransform>,
    extras: Vec<InstanceExtra>,
}

impl InstanceArrays {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Storage capacity that GPU-side buffers mirror.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.transforms.capacity()
    }

    /// Append an instance with an identity transform; returns its index.
    pub fn push(&mut self, owner: PositionRef, extra: InstanceExtra) -> usize {
        let index = self.owners.len();
        self.owners.push(owner);
        self.transforms.push(InstanceTransform::default());
        self.extras.push(extra);
        index
    }

    /// Swap-remove `index` from all arrays.
    pub fn remove_at(&mut self, index: usize) -> Option<Relocation> {
        assert!(
            index < self.owners.len(),
            "instance index {index} out of range ({})",
            self.owners.len()
        );
        let from = self.owners.len() - 1;
        self.owners.swap_remove(index);
        self.transforms.swap_remove(index);
        self.extras.swap_remove(index);
        (index < from).then(|| Relocation {
            owner: self.owners[index],
            from,
            to: index,
        })
    }

    #[inline]
    pub fn owner(&self, index: usize) -> Option<PositionRef> {
        self.owners.get(index).copied()
    }

    #[inline]
    pub fn transform(&self, index: usize) -> Option<&InstanceTransform> {
        self.transforms.get(index)
    }

    #[inline]
    pub fn extra(&self, index: usize) -> Option<&InstanceExtra> {
        self.extras.get(index)
    }

    pub fn set_transform(&mut self, index: usize, transform: InstanceTransform) {
        self.transforms[index] = transform;
    }

    pub fn extra_mut(&mut self, index: usize) -> &mut InstanceExtra {
        &mut self.extras[index]
    }

    pub fn owners(&self) -> &[PositionRef] {
        &self.owners
    }

    pub fn transforms(&self) -> &[InstanceTransform] {
        &self.transforms
    }

    pub fn extras(&self) -> &[InstanceExtra] {
        &self.extras
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::BlockId;

    fn owner(slot: usize) -> PositionRef {
        PositionRef {
            block: BlockId(0),
            slot,
        }
    }

    fn extra(random: f32) -> InstanceExtra {
        InstanceExtra {
            random,
            ..Default::default()
        }
    }

    #[test]
    fn remove_last_reports_nothing_moved() {
        let mut arrays = InstanceArrays::new();
        arrays.push(owner(0), extra(0.0));
        arrays.push(owner(1), extra(0.1));
        assert_eq!(arrays.remove_at(1), None);
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays.owner(0), Some(owner(0)));
    }

    #[test]
    fn remove_middle_moves_last_into_hole() {
        let mut arrays = InstanceArrays::new();
        for i in 0..4 {
            let idx = arrays.push(owner(i), extra(i as f32));
            arrays.set_transform(idx, InstanceTransform::new(&Mat3::IDENTITY, Vec3::new(i as f32, 0.0, 0.0)));
        }
        let moved = arrays.remove_at(1).expect("last element moved");
        assert_eq!(
            moved,
            Relocation {
                owner: owner(3),
                from: 3,
                to: 1
            }
        );
        assert_eq!(arrays.len(), 3);
        assert_eq!(arrays.owner(1), Some(owner(3)));
        assert_eq!(arrays.extra(1).map(|e| e.random), Some(3.0));
        assert_eq!(arrays.transform(1).map(|t| t.translation().x), Some(3.0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn remove_out_of_range_is_a_logic_error() {
        let mut arrays = InstanceArrays::new();
        let _ = arrays.remove_at(0);
    }

    #[test]
    fn transform_layout_is_row_major_with_translation_last() {
        let rot = Mat3::rotation_y(std::f32::consts::FRAC_PI_2);
        let t = InstanceTransform::new(&rot, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(t.translation(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(t.m[0], rot.m[0][0]);
        assert_eq!(t.m[2], rot.m[0][2]);
        assert_eq!(t.m[8], rot.m[2][0]);
        assert_eq!(t.m[5], 1.0);
    }
}
