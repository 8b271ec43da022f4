//! Concentric request rings around the player.
//!
//! Rings are squares in chunk space (Chebyshev distance). The urgent ring is
//! what the player stands on and must arrive first, the visible ring is
//! what is on screen, and the preload ring is fetched speculatively.

use tilestream_config::StreamingConfig;
use tilestream_world::ChunkCoord;

/// Ring radii in chunks. Each radius includes the ones inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRadii {
    pub urgent: u32,
    pub visible: u32,
    pub preload: u32,
}

impl RingRadii {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            urgent: config.urgent_radius,
            visible: config.visible_radius.max(config.urgent_radius),
            preload: config
                .preload_radius
                .max(config.visible_radius)
                .max(config.urgent_radius),
        }
    }
}

impl Default for RingRadii {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

/// Chunks to request, split by ring and sorted nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadPlan {
    pub center: ChunkCoord,
    /// Distance `0..=urgent`.
    pub urgent: Vec<ChunkCoord>,
    /// Distance `urgent+1..=visible`.
    pub visible: Vec<ChunkCoord>,
    /// Distance `visible+1..=preload`.
    pub preload: Vec<ChunkCoord>,
}

impl PreloadPlan {
    /// Total coordinates across all rings.
    pub fn len(&self) -> usize {
        self.urgent.len() + self.visible.len() + self.preload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plan every ring around the chunk containing `center_tile`.
pub fn plan_rings(center_tile: (i32, i32), radii: RingRadii) -> PreloadPlan {
    let center = ChunkCoord::from_tile(center_tile.0, center_tile.1);
    let mut plan = PreloadPlan {
        center,
        ..PreloadPlan::default()
    };

    for coord in square(center, radii.preload) {
        let d = coord.ring_distance(&center);
        if d <= radii.urgent {
            plan.urgent.push(coord);
        } else if d <= radii.visible {
            plan.visible.push(coord);
        } else {
            plan.preload.push(coord);
        }
    }

    for ring in [&mut plan.urgent, &mut plan.visible, &mut plan.preload] {
        ring.sort_by_key(|c| (c.distance_sq(&center), *c));
    }
    plan
}

/// Only the urgent ring, for the tight poll.
pub fn plan_urgent(center_tile: (i32, i32), radius: u32) -> Vec<ChunkCoord> {
    let center = ChunkCoord::from_tile(center_tile.0, center_tile.1);
    let mut coords: Vec<ChunkCoord> = square(center, radius).collect();
    coords.sort_by_key(|c| (c.distance_sq(&center), *c));
    coords
}

fn square(center: ChunkCoord, radius: u32) -> impl Iterator<Item = ChunkCoord> {
    let r = i64::from(radius);
    (-r..=r).flat_map(move |dy| {
        (-r..=r).filter_map(move |dx| {
            let x = i32::try_from(i64::from(center.x) + dx).ok()?;
            let y = i32::try_from(i64::from(center.y) + dy).ok()?;
            Some(ChunkCoord::new(x, y))
        })
    })
}
