//! Polygon filtering & traversal costs.

use bevy::prelude::Vec3;

use crate::mesh::{Area, MeshTile, Poly, PolyFlags};

/// Decides which polygons a search may enter and what crossing them costs.
///
/// Called at every node expansion; implementations must be pure, and costs
/// must be non-negative and scale with distance for A* to stay optimal.
pub trait QueryFilter {
    fn passes(&self, tile: &MeshTile, poly: &Poly) -> bool;

    /// Cost of travelling `pa -> pb` through `poly`. The neighbouring
    /// polygons are provided for context; the standard filter ignores them.
    #[allow(clippy::too_many_arguments)]
    fn cost(
        &self,
        pa: Vec3,
        pb: Vec3,
        prev: Option<(&MeshTile, &Poly)>,
        cur: (&MeshTile, &Poly),
        next: Option<(&MeshTile, &Poly)>,
    ) -> f32;
}

/// Flag-mask filter with a per-area cost multiplier.
#[derive(Debug, Clone)]
pub struct StandardFilter {
    pub include_flags: PolyFlags,
    pub exclude_flags: PolyFlags,
    pub area_costs: [f32; 64],
}

impl Default for StandardFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
            area_costs: [1.0; 64],
        }
    }
}

impl StandardFilter {
    pub fn with_flags(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Default::default()
        }
    }

    pub fn set_area_cost(&mut self, area: Area, cost: f32) {
        self.area_costs[area.0 as usize] = cost;
    }
}

impl QueryFilter for StandardFilter {
    #[inline]
    fn passes(&self, _tile: &MeshTile, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    #[inline]
    fn cost(
        &self,
        pa: Vec3,
        pb: Vec3,
        _prev: Option<(&MeshTile, &Poly)>,
        cur: (&MeshTile, &Poly),
        _next: Option<(&MeshTile, &Poly)>,
    ) -> f32 {
        pa.distance(pb) * self.area_costs[cur.1.area().0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_filter_applies_masks() {
        let filter = StandardFilter::with_flags(PolyFlags::WALK, PolyFlags::DISABLED);
        let tile = MeshTile::default();

        let mut poly = Poly {
            flags: PolyFlags::WALK,
            ..Default::default()
        };
        assert!(filter.passes(&tile, &poly));

        poly.flags = PolyFlags::WALK | PolyFlags::DISABLED;
        assert!(!filter.passes(&tile, &poly));

        poly.flags = PolyFlags::SWIM;
        assert!(!filter.passes(&tile, &poly));
    }

    #[test]
    fn cost_scales_with_area() {
        let mut filter = StandardFilter::default();
        filter.set_area_cost(Area(3), 10.0);

        let tile = MeshTile::default();
        let mut poly = Poly::default();
        poly.set_area(Area(3));

        let cost = filter.cost(
            Vec3::ZERO,
            Vec3::new(2.0, 0.0, 0.0),
            None,
            (&tile, &poly),
            None,
        );
        assert!((cost - 20.0).abs() < 1e-5);
    }
}
