//! Voxel ray traversal (Amanatides–Woo).

use glam::DVec3;
use vaste_utils::BlockPos;

/// A voxel hit by a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    /// The hit voxel.
    pub pos: BlockPos,
    /// The block type found there.
    pub block: u16,
    /// Unit normal of the entered face; zero when the ray started
    /// inside the block.
    pub normal: (i32, i32, i32),
    /// Distance traveled along the ray.
    pub distance: f64,
}

/// Walks the voxel grid along a ray and returns the first non-air
/// cell, or `None` when `max_distance` runs out.
///
/// Voxels are centered on integer coordinates, so the origin is
/// shifted by +0.5 before flooring. If the origin is already inside a
/// block, that cell is returned with zero normal and distance.
pub fn raycast(
    lookup: impl Fn(BlockPos) -> u16,
    origin: DVec3,
    direction: DVec3,
    max_distance: f64,
) -> Option<RaycastHit> {
    let shifted = origin + DVec3::splat(0.5);
    let mut cell = BlockPos::new(
        shifted.x.floor() as i32,
        shifted.y.floor() as i32,
        shifted.z.floor() as i32,
    );

    let start_block = lookup(cell);
    if start_block != 0 {
        return Some(RaycastHit {
            pos: cell,
            block: start_block,
            normal: (0, 0, 0),
            distance: 0.0,
        });
    }

    let step = [
        direction.x.signum() as i32,
        direction.y.signum() as i32,
        direction.z.signum() as i32,
    ];
    let t_delta = [
        1.0 / direction.x.abs(),
        1.0 / direction.y.abs(),
        1.0 / direction.z.abs(),
    ];
    // Distance along the ray to the first boundary crossing per axis.
    let boundary = |position: f64, cell: i32, dir: f64| -> f64 {
        if dir > 0.0 {
            (f64::from(cell) + 1.0 - position) / dir
        } else if dir < 0.0 {
            (position - f64::from(cell)) / -dir
        } else {
            f64::INFINITY
        }
    };
    let mut t_max = [
        boundary(shifted.x, cell.x, direction.x),
        boundary(shifted.y, cell.y, direction.y),
        boundary(shifted.z, cell.z, direction.z),
    ];

    loop {
        let axis = (0..3).min_by(|&a, &b| t_max[a].total_cmp(&t_max[b]))?;
        let traveled = t_max[axis];
        if traveled > max_distance {
            return None;
        }
        match axis {
            0 => cell.x += step[0],
            1 => cell.y += step[1],
            _ => cell.z += step[2],
        }
        t_max[axis] += t_delta[axis];

        let block = lookup(cell);
        if block != 0 {
            let mut normal = [0, 0, 0];
            normal[axis] = -step[axis];
            return Some(RaycastHit {
                pos: cell,
                block,
                normal: (normal[0], normal[1], normal[2]),
                distance: traveled,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn world(blocks: &[(i32, i32, i32, u16)]) -> FxHashMap<i64, u16> {
        blocks
            .iter()
            .map(|&(x, y, z, block)| (BlockPos::new(x, y, z).as_i64(), block))
            .collect()
    }

    fn lookup(map: &FxHashMap<i64, u16>) -> impl Fn(BlockPos) -> u16 + '_ {
        move |pos| map.get(&pos.as_i64()).copied().unwrap_or(0)
    }

    #[test]
    fn hits_block_straight_ahead() {
        let map = world(&[(5, 0, 0, 3)]);
        let hit = raycast(
            lookup(&map),
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            10.0,
        )
        .expect("hit");
        assert_eq!(hit.pos, BlockPos::new(5, 0, 0));
        assert_eq!(hit.block, 3);
        assert_eq!(hit.normal, (-1, 0, 0), "entered through the -X face");
        assert!((hit.distance - 4.5).abs() < 1e-9);
    }

    #[test]
    fn starting_inside_returns_zero_distance() {
        let map = world(&[(0, 0, 0, 7)]);
        let hit = raycast(
            lookup(&map),
            DVec3::new(0.2, 0.1, -0.3),
            DVec3::new(0.0, 1.0, 0.0),
            10.0,
        )
        .expect("hit");
        assert_eq!(hit.pos, BlockPos::new(0, 0, 0));
        assert_eq!(hit.normal, (0, 0, 0));
        assert_eq!(hit.distance, 0.0);
    }

    #[test]
    fn respects_max_distance() {
        let map = world(&[(8, 0, 0, 1)]);
        assert!(
            raycast(
                lookup(&map),
                DVec3::ZERO,
                DVec3::new(1.0, 0.0, 0.0),
                5.0
            )
            .is_none()
        );
    }

    #[test]
    fn diagonal_traversal_visits_the_blocking_cell() {
        let map = world(&[(2, 2, 0, 4)]);
        let hit = raycast(
            lookup(&map),
            DVec3::ZERO,
            DVec3::new(1.0, 1.0, 0.0).normalize(),
            10.0,
        )
        .expect("hit");
        assert_eq!(hit.pos, BlockPos::new(2, 2, 0));
        assert!(hit.normal == (-1, 0, 0) || hit.normal == (0, -1, 0));
    }

    #[test]
    fn hits_below_when_looking_down() {
        let map = world(&[(0, -2, 0, 9)]);
        let hit = raycast(
            lookup(&map),
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(0.0, -1.0, 0.0),
            10.0,
        )
        .expect("hit");
        assert_eq!(hit.pos, BlockPos::new(0, -2, 0));
        assert_eq!(hit.normal, (0, 1, 0));
    }
}
