use glam::Vec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a voxel in the point cloud catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelId(pub Uuid);

impl VoxelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VoxelId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a backing store (one point cloud file or remote object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(pub u64);

/// Opaque identifier of an object living behind a remote transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteObjectId(pub Uuid);

impl RemoteObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RemoteObjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a query client. `ClientId::NONE` marks "no state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub i64);

impl ClientId {
    pub const NONE: ClientId = ClientId(-1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Axis-aligned spatial extents of a voxel or query region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    pub min: Vec3,
    pub max: Vec3,
}

impl Extents {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Extents covering all of space.
    pub fn infinite() -> Self {
        Self {
            min: Vec3::splat(f32::NEG_INFINITY),
            max: Vec3::splat(f32::INFINITY),
        }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Extents) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }
}

impl Default for Extents {
    fn default() -> Self {
        Self {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        }
    }
}

/// Per-point channels stored for a voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Three little-endian `f32` coordinates.
    Position,
    Rgb,
    Intensity,
    Normal,
    Classification,
}

impl ChannelKind {
    pub const fn bytes_per_point(self) -> usize {
        match self {
            ChannelKind::Position => 12,
            ChannelKind::Rgb => 3,
            ChannelKind::Intensity => 2,
            ChannelKind::Normal => 6,
            ChannelKind::Classification => 1,
        }
    }
}

/// Clamp a level-of-detail fraction to `[0, 1]`. NaN maps to 0.
pub fn clamp_lod(lod: f32) -> f32 {
    if lod.is_nan() { 0.0 } else { lod.clamp(0.0, 1.0) }
}

/// Number of points making up the `lod` subset of `total` points.
///
/// Points are stored in progressive order, so the first `points_at_lod`
/// points of a voxel form its coarse representation at that level.
pub fn points_at_lod(total: u64, lod: f32) -> u64 {
    let lod = clamp_lod(lod);
    if lod >= 1.0 {
        return total;
    }
    // Tolerance so a fraction computed as points / total maps back to the same count.
    ((total as f64 * lod as f64 - 1e-6).ceil().max(0.0) as u64).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_id_uniqueness() {
        let a = VoxelId::new();
        let b = VoxelId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn client_none_sentinel() {
        assert!(ClientId::NONE.is_none());
        assert_eq!(ClientId::NONE, ClientId(-1));
        assert!(!ClientId(7).is_none());
    }

    #[test]
    fn extents_normalizes_corners() {
        let e = Extents::new(Vec3::new(1.0, 5.0, -2.0), Vec3::new(-1.0, 0.0, 2.0));
        assert_eq!(e.min, Vec3::new(-1.0, 0.0, -2.0));
        assert_eq!(e.max, Vec3::new(1.0, 5.0, 2.0));
        assert!(e.contains(Vec3::ZERO));
        assert!(!e.contains(Vec3::new(0.0, 6.0, 0.0)));
    }

    #[test]
    fn extents_intersection() {
        let a = Extents::new(Vec3::ZERO, Vec3::ONE);
        let b = Extents::new(Vec3::splat(0.5), Vec3::splat(2.0));
        let c = Extents::new(Vec3::splat(3.0), Vec3::splat(4.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(Extents::infinite().intersects(&c));
    }

    #[test]
    fn channel_sizes() {
        assert_eq!(ChannelKind::Position.bytes_per_point(), 12);
        assert_eq!(ChannelKind::Classification.bytes_per_point(), 1);
    }

    #[test]
    fn lod_point_counts() {
        assert_eq!(points_at_lod(100, 0.0), 0);
        assert_eq!(points_at_lod(100, 0.5), 50);
        assert_eq!(points_at_lod(100, 0.011), 2);
        assert_eq!(points_at_lod(100, 1.0), 100);
        assert_eq!(points_at_lod(100, 7.0), 100);
        assert_eq!(points_at_lod(100, f32::NAN), 0);
        assert_eq!(points_at_lod(0, 1.0), 0);
        assert_eq!(points_at_lod(10, (3.0f64 / 10.0) as f32), 3);
    }
}
