//! The six face directions of a voxel.

use crate::types::BlockPos;

/// The six face directions of a voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Negative Y direction.
    Down,
    /// Positive Y direction.
    Up,
    /// Negative Z direction.
    North,
    /// Positive Z direction.
    South,
    /// Negative X direction.
    West,
    /// Positive X direction.
    East,
}

impl Direction {
    /// All six directions, in the order neighbor version bumps and face
    /// emission iterate them.
    pub const ALL: [Direction; 6] = [
        Direction::Down,
        Direction::Up,
        Direction::North,
        Direction::South,
        Direction::West,
        Direction::East,
    ];

    /// Returns the block position offset for this direction.
    #[must_use]
    pub const fn offset(&self) -> (i32, i32, i32) {
        match self {
            Direction::Down => (0, -1, 0),
            Direction::Up => (0, 1, 0),
            Direction::North => (0, 0, -1),
            Direction::South => (0, 0, 1),
            Direction::West => (-1, 0, 0),
            Direction::East => (1, 0, 0),
        }
    }

    /// Returns the unit normal of a face pointing in this direction.
    #[must_use]
    pub const fn normal(&self) -> [f32; 3] {
        let (dx, dy, dz) = self.offset();
        [dx as f32, dy as f32, dz as f32]
    }

    /// Returns the block position relative to the given position in this direction.
    #[must_use]
    pub const fn relative(&self, pos: BlockPos) -> BlockPos {
        let (dx, dy, dz) = self.offset();
        pos.offset(dx, dy, dz)
    }

    /// Returns the opposite direction.
    #[must_use]
    pub const fn opposite(&self) -> Direction {
        match self {
            Direction::Down => Direction::Up,
            Direction::Up => Direction::Down,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
            Direction::East => Direction::West,
        }
    }

    /// Index of this direction in [`Direction::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposites_cancel() {
        for dir in Direction::ALL {
            let (dx, dy, dz) = dir.offset();
            let (ox, oy, oz) = dir.opposite().offset();
            assert_eq!((dx + ox, dy + oy, dz + oz), (0, 0, 0));
        }
    }

    #[test]
    fn index_matches_all_order() {
        for (i, dir) in Direction::ALL.iter().enumerate() {
            assert_eq!(dir.index(), i);
        }
    }
}
