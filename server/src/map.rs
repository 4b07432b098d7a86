//! Tile maps: walkability queries, spawn sampling and the standing worlds.
//!
//! One tile is one world unit. Entity positions are real-valued; a position
//! is inside tile `(floor(x), floor(y))`. Movement collision samples five
//! points of the moving circle (center plus the four radius corners) and
//! requires every sampled tile to be walkable.

use rand::Rng;

use realm_shared::{Tile, Vec2};

/// Axis-aligned tile rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x as f32
            && y >= self.y as f32
            && x < (self.x + self.w) as f32
            && y < (self.y + self.h) as f32
    }

    /// Overlap test with an optional buffer ring around `other`.
    pub fn intersects(&self, other: &Rect, buffer: i32) -> bool {
        !(self.x + self.w + buffer <= other.x
            || other.x + other.w + buffer <= self.x
            || self.y + self.h + buffer <= other.y
            || other.y + other.h + buffer <= self.y)
    }
}

/// A rectangle that continuously replenishes enemies.
#[derive(Debug, Clone)]
pub struct SpawnRegion {
    pub area: Rect,
    /// (enemy definition id, relative weight).
    pub weights: Vec<(String, f32)>,
    /// Spawning pauses while this many enemies stand inside the rectangle.
    pub max_alive: usize,
    /// Spawns per second while below `max_alive`.
    pub rate: f32,
}

impl SpawnRegion {
    /// Weighted pick of an enemy type for this region.
    pub fn pick_enemy(&self, rng: &mut impl Rng) -> Option<&str> {
        let total: f32 = self.weights.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return None;
        }
        let mut roll = rng.gen_range(0.0..total);
        for (id, weight) in &self.weights {
            if roll < *weight {
                return Some(id);
            }
            roll -= weight;
        }
        self.weights.last().map(|(id, _)| id.as_str())
    }
}

/// Immutable tile grid plus its spawn regions.
#[derive(Debug, Clone)]
pub struct TileMap {
    pub width: usize,
    pub height: usize,
    tiles: Vec<Tile>,
    pub regions: Vec<SpawnRegion>,
}

impl TileMap {
    pub fn filled(width: usize, height: usize, fill: Tile) -> TileMap {
        TileMap {
            width,
            height,
            tiles: vec![fill; width * height],
            regions: Vec::new(),
        }
    }

    pub fn tile(&self, x: i32, y: i32) -> Tile {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return Tile::Void;
        }
        self.tiles[y as usize * self.width + x as usize]
    }

    pub fn set_tile(&mut self, x: i32, y: i32, tile: Tile) {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return;
        }
        self.tiles[y as usize * self.width + x as usize] = tile;
    }

    /// The raw tile codes, row-major, for instance-change payloads.
    pub fn tile_codes(&self) -> Vec<u8> {
        self.tiles.iter().map(|t| t.to_u8()).collect()
    }

    pub fn is_walkable_at(&self, x: f32, y: f32) -> bool {
        self.tile(x.floor() as i32, y.floor() as i32).is_walkable()
    }

    /// Five-point circle test: center plus the four radius corners must all
    /// land on walkable tiles.
    pub fn can_move_to(&self, pos: Vec2, radius: f32) -> bool {
        self.is_walkable_at(pos.x, pos.y)
            && self.is_walkable_at(pos.x - radius, pos.y - radius)
            && self.is_walkable_at(pos.x + radius, pos.y - radius)
            && self.is_walkable_at(pos.x - radius, pos.y + radius)
            && self.is_walkable_at(pos.x + radius, pos.y + radius)
    }

    /// Random walkable point inside `area`, capped at 20 rejection attempts.
    pub fn random_walkable_in(&self, area: Rect, rng: &mut impl Rng) -> Option<Vec2> {
        for _ in 0..20 {
            let x = rng.gen_range(area.x as f32..(area.x + area.w) as f32);
            let y = rng.gen_range(area.y as f32..(area.y + area.h) as f32);
            let pos = Vec2::new(x, y);
            if self.can_move_to(pos, 0.5) {
                return Some(pos);
            }
        }
        None
    }

    /// Entry position for an arriving player: the center of a random spawn
    /// tile when the map has them, otherwise the first walkable tile nearest
    /// the map center.
    pub fn choose_spawn(&self, rng: &mut impl Rng) -> Vec2 {
        let spawn_tiles: Vec<(usize, usize)> = (0..self.height)
            .flat_map(|y| (0..self.width).map(move |x| (x, y)))
            .filter(|&(x, y)| self.tiles[y * self.width + x] == Tile::Spawn)
            .collect();
        if !spawn_tiles.is_empty() {
            let (x, y) = spawn_tiles[rng.gen_range(0..spawn_tiles.len())];
            return Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
        }

        let cx = self.width as f32 / 2.0;
        let cy = self.height as f32 / 2.0;
        let mut best: Option<(f32, Vec2)> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if !self.tiles[y * self.width + x].is_walkable() {
                    continue;
                }
                let pos = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let d = (pos.x - cx).powi(2) + (pos.y - cy).powi(2);
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, pos));
                }
            }
        }
        best.map(|(_, pos)| pos).unwrap_or(Vec2::new(cx, cy))
    }

    fn fill_rect(&mut self, area: Rect, tile: Tile) {
        for y in area.y..area.y + area.h {
            for x in area.x..area.x + area.w {
                self.set_tile(x, y, tile);
            }
        }
    }
}

/// The safe hub: a walled square of floor with a spawn pad in the middle.
/// Portals are wired in by the orchestrator.
pub fn build_nexus() -> TileMap {
    let mut map = TileMap::filled(32, 32, Tile::Wall);
    map.fill_rect(Rect::new(1, 1, 30, 30), Tile::Floor);
    map.fill_rect(Rect::new(14, 14, 4, 4), Tile::Spawn);
    map
}

/// The open hostile world: a large walled field with rock clusters, a lake,
/// a lava pocket and four standing spawn regions.
pub fn build_realm(rng: &mut impl Rng) -> TileMap {
    let (w, h) = (80usize, 80usize);
    let mut map = TileMap::filled(w, h, Tile::Wall);
    map.fill_rect(Rect::new(1, 1, w as i32 - 2, h as i32 - 2), Tile::Floor);

    // Scatter impassable rock clusters away from the spawn pad.
    for _ in 0..26 {
        let cw = rng.gen_range(2..5);
        let ch = rng.gen_range(2..5);
        let cx = rng.gen_range(2..w as i32 - 2 - cw);
        let cy = rng.gen_range(2..h as i32 - 2 - ch);
        let cluster = Rect::new(cx, cy, cw, ch);
        if cluster.intersects(&Rect::new(36, 36, 8, 8), 2) {
            continue;
        }
        map.fill_rect(cluster, Tile::Wall);
    }
    map.fill_rect(Rect::new(8, 56, 12, 10), Tile::Water);
    map.fill_rect(Rect::new(60, 8, 8, 6), Tile::Lava);
    map.fill_rect(Rect::new(38, 38, 4, 4), Tile::Spawn);

    map.regions = vec![
        SpawnRegion {
            area: Rect::new(4, 4, 30, 30),
            weights: vec![
                ("pirate".to_string(), 3.0),
                ("pirate_deckhand".to_string(), 2.0),
            ],
            max_alive: 12,
            rate: 0.5,
        },
        SpawnRegion {
            area: Rect::new(46, 4, 30, 30),
            weights: vec![
                ("pirate".to_string(), 2.0),
                ("sand_guardian".to_string(), 1.0),
            ],
            max_alive: 10,
            rate: 0.4,
        },
        SpawnRegion {
            area: Rect::new(4, 46, 30, 30),
            weights: vec![
                ("pirate_deckhand".to_string(), 3.0),
                ("sand_guardian".to_string(), 1.0),
            ],
            max_alive: 10,
            rate: 0.4,
        },
        SpawnRegion {
            area: Rect::new(46, 46, 30, 30),
            weights: vec![("demon".to_string(), 1.0), ("pirate".to_string(), 2.0)],
            max_alive: 6,
            rate: 0.2,
        },
    ];
    map
}

/// A private vault room. The chest position is the room center.
pub fn build_vault() -> (TileMap, Vec2) {
    let mut map = TileMap::filled(16, 16, Tile::Wall);
    map.fill_rect(Rect::new(1, 1, 14, 14), Tile::Floor);
    map.fill_rect(Rect::new(6, 10, 4, 3), Tile::Spawn);
    (map, Vec2::new(8.0, 6.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_tile_lookup_out_of_bounds_is_void() {
        let map = TileMap::filled(4, 4, Tile::Floor);
        assert_eq!(map.tile(-1, 0), Tile::Void);
        assert_eq!(map.tile(0, -1), Tile::Void);
        assert_eq!(map.tile(4, 0), Tile::Void);
        assert_eq!(map.tile(0, 4), Tile::Void);
        assert_eq!(map.tile(2, 2), Tile::Floor);
    }

    #[test]
    fn test_can_move_to_blocks_wall_corners() {
        let mut map = TileMap::filled(8, 8, Tile::Floor);
        map.set_tile(4, 4, Tile::Wall);
        // Center tile clear but a radius corner pokes into the wall tile.
        assert!(!map.can_move_to(Vec2::new(3.8, 3.8), 0.35));
        assert!(map.can_move_to(Vec2::new(3.0, 3.0), 0.35));
    }

    #[test]
    fn test_can_move_to_respects_radius() {
        let mut map = TileMap::filled(8, 8, Tile::Floor);
        map.set_tile(6, 5, Tile::Wall);
        // A player of radius 0.35 fits at x = 5.6 but not at 5.7.
        assert!(map.can_move_to(Vec2::new(5.6, 5.5), 0.35));
        assert!(!map.can_move_to(Vec2::new(5.7, 5.5), 0.35));
    }

    #[test]
    fn test_random_walkable_rejects_solid_region() {
        let map = TileMap::filled(8, 8, Tile::Wall);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(map
            .random_walkable_in(Rect::new(0, 0, 8, 8), &mut rng)
            .is_none());
    }

    #[test]
    fn test_choose_spawn_prefers_spawn_tiles() {
        let mut map = TileMap::filled(10, 10, Tile::Floor);
        map.set_tile(2, 7, Tile::Spawn);
        let mut rng = StdRng::seed_from_u64(1);
        let pos = map.choose_spawn(&mut rng);
        assert_eq!(pos, Vec2::new(2.5, 7.5));
    }

    #[test]
    fn test_nexus_is_enclosed() {
        let map = build_nexus();
        for x in 0..map.width as i32 {
            assert_eq!(map.tile(x, 0), Tile::Wall);
            assert_eq!(map.tile(x, map.height as i32 - 1), Tile::Wall);
        }
        for y in 0..map.height as i32 {
            assert_eq!(map.tile(0, y), Tile::Wall);
            assert_eq!(map.tile(map.width as i32 - 1, y), Tile::Wall);
        }
        assert!(map.regions.is_empty());
    }

    #[test]
    fn test_realm_has_regions_and_spawn_pad() {
        let mut rng = StdRng::seed_from_u64(42);
        let map = build_realm(&mut rng);
        assert_eq!(map.regions.len(), 4);
        let spawn = map.choose_spawn(&mut rng);
        assert!(map.can_move_to(spawn, 0.35));
        for region in &map.regions {
            assert!(region.max_alive > 0);
            assert!(region.rate > 0.0);
            assert!(!region.weights.is_empty());
        }
    }

    #[test]
    fn test_region_weighted_pick_honors_weights() {
        let region = SpawnRegion {
            area: Rect::new(0, 0, 4, 4),
            weights: vec![("only".to_string(), 1.0)],
            max_alive: 1,
            rate: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            assert_eq!(region.pick_enemy(&mut rng), Some("only"));
        }
    }

    #[test]
    fn test_vault_chest_is_reachable() {
        let (map, chest) = build_vault();
        assert!(map.can_move_to(chest, 0.35));
        let mut rng = StdRng::seed_from_u64(9);
        let spawn = map.choose_spawn(&mut rng);
        assert!(spawn.distance(chest) < 16.0);
    }
}
