//! Hashed uniform grid for agent-vs-agent proximity queries. Rebuilt from
//! scratch every tick; items live in a fixed pool threaded through hash
//! buckets.

use bevy::math::Vec2;

const INVALID_ITEM: u16 = u16::MAX;

#[derive(Clone, Copy, Default)]
struct GridItem {
    id: u16,
    x: i16,
    y: i16,
    next: u16,
}

pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    pool: Vec<GridItem>,
    pool_head: usize,
    buckets: Vec<u16>,
}

#[inline]
fn hash_cell(x: i32, y: i32, bucket_mask: u32) -> usize {
    let h = (x.wrapping_mul(73856093) ^ y.wrapping_mul(19349663)) as u32;
    (h & bucket_mask) as usize
}

impl ProximityGrid {
    pub fn new(pool_size: usize, cell_size: f32) -> Self {
        let bucket_count = pool_size.max(1).next_power_of_two();

        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            pool: vec![GridItem::default(); pool_size],
            pool_head: 0,
            buckets: vec![INVALID_ITEM; bucket_count],
        }
    }

    pub fn clear(&mut self) {
        self.buckets.fill(INVALID_ITEM);
        self.pool_head = 0;
    }

    /// Registers `id` in every cell the rectangle overlaps.
    pub fn add(&mut self, id: u16, min: Vec2, max: Vec2) {
        let min_x = (min.x * self.inv_cell_size).floor() as i32;
        let min_y = (min.y * self.inv_cell_size).floor() as i32;
        let max_x = (max.x * self.inv_cell_size).floor() as i32;
        let max_y = (max.y * self.inv_cell_size).floor() as i32;

        let bucket_mask = self.buckets.len() as u32 - 1;

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                if self.pool_head >= self.pool.len() {
                    return;
                }

                let bucket = hash_cell(x, y, bucket_mask);
                let index = self.pool_head as u16;
                self.pool_head += 1;

                self.pool[index as usize] = GridItem {
                    id,
                    x: x as i16,
                    y: y as i16,
                    next: self.buckets[bucket],
                };
                self.buckets[bucket] = index;
            }
        }
    }

    /// Distinct ids overlapping the rectangle, at most `max_ids` of them.
    pub fn query(&self, min: Vec2, max: Vec2, out: &mut Vec<u16>, max_ids: usize) {
        let min_x = (min.x * self.inv_cell_size).floor() as i32;
        let min_y = (min.y * self.inv_cell_size).floor() as i32;
        let max_x = (max.x * self.inv_cell_size).floor() as i32;
        let max_y = (max.y * self.inv_cell_size).floor() as i32;

        let bucket_mask = self.buckets.len() as u32 - 1;

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let mut index = self.buckets[hash_cell(x, y, bucket_mask)];
                while index != INVALID_ITEM {
                    let item = &self.pool[index as usize];
                    if item.x as i32 == x && item.y as i32 == y {
                        // Linear dedup; the output stays tiny.
                        if !out.contains(&item.id) {
                            if out.len() >= max_ids {
                                return;
                            }
                            out.push(item.id);
                        }
                    }
                    index = item.next;
                }
            }
        }
    }

    #[inline]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_returns_overlapping_ids_once() {
        let mut grid = ProximityGrid::new(64, 1.0);

        // Spans four cells; must still be reported once.
        grid.add(7, Vec2::new(0.2, 0.2), Vec2::new(1.8, 1.8));
        grid.add(9, Vec2::new(10.0, 10.0), Vec2::new(10.5, 10.5));

        let mut ids = Vec::new();
        grid.query(Vec2::new(0.0, 0.0), Vec2::new(2.0, 2.0), &mut ids, 16);

        assert_eq!(ids, vec![7]);
    }

    #[test]
    fn clear_resets_the_pool() {
        let mut grid = ProximityGrid::new(8, 1.0);
        grid.add(1, Vec2::ZERO, Vec2::new(0.5, 0.5));
        grid.clear();

        let mut ids = Vec::new();
        grid.query(Vec2::new(-1.0, -1.0), Vec2::new(1.0, 1.0), &mut ids, 16);
        assert!(ids.is_empty());
    }

    #[test]
    fn query_respects_the_id_cap() {
        let mut grid = ProximityGrid::new(64, 1.0);
        for id in 0..10 {
            grid.add(id, Vec2::new(0.1, 0.1), Vec2::new(0.2, 0.2));
        }

        let mut ids = Vec::new();
        grid.query(Vec2::ZERO, Vec2::new(1.0, 1.0), &mut ids, 4);
        assert_eq!(ids.len(), 4);
    }
}
