//! Procedural dungeon layout generation.
//!
//! Rooms branch from a start room at the left-center of the grid, growing
//! mostly rightward. The rightmost room becomes the boss room. Rooms are
//! joined by 2-tile-wide L-corridors through their centers, the start room
//! is painted with spawn tiles, and each room emits spawn regions for the
//! instance's scheduler.

use rand::Rng;

use realm_shared::{Tile, Vec2};

use crate::content::DungeonDef;
use crate::map::{Rect, SpawnRegion, TileMap};

/// A generated dungeon: the map plus the two anchor points the orchestrator
/// needs.
#[derive(Debug)]
pub struct DungeonLayout {
    pub map: TileMap,
    pub boss_room_center: Vec2,
    pub entry_point: Vec2,
}

struct Placement {
    area: Rect,
    parent: Option<usize>,
}

/// Branch direction weights: right 0.6, down 0.2, up 0.2.
fn pick_direction(rng: &mut impl Rng) -> (i32, i32) {
    let roll: f32 = rng.gen_range(0.0..1.0);
    if roll < 0.6 {
        (1, 0)
    } else if roll < 0.8 {
        (0, 1)
    } else {
        (0, -1)
    }
}

pub fn generate(def: &DungeonDef, rng: &mut impl Rng) -> DungeonLayout {
    let mut map = TileMap::filled(def.width, def.height, Tile::Void);
    let mut rooms: Vec<Placement> = Vec::new();

    // Start room at left-center.
    let start_size = rng.gen_range(def.room_min..=def.room_max) as i32;
    let start = Rect::new(
        2,
        def.height as i32 / 2 - start_size / 2,
        start_size,
        start_size,
    );
    rooms.push(Placement {
        area: start,
        parent: None,
    });

    let target_rooms = rng.gen_range(def.min_rooms..=def.max_rooms);
    let mut attempts = 0;
    while rooms.len() < target_rooms && attempts < 200 {
        attempts += 1;
        let parent_idx = rng.gen_range(0..rooms.len());
        let parent = rooms[parent_idx].area;
        let (dx, dy) = pick_direction(rng);
        let size_w = rng.gen_range(def.room_min..=def.room_max) as i32;
        let size_h = rng.gen_range(def.room_min..=def.room_max) as i32;
        let gap = rng.gen_range(def.gap_min..=def.gap_max) as i32;

        let (pcx, pcy) = parent.center();
        let candidate = if dx != 0 {
            Rect::new(parent.x + parent.w + gap, pcy - size_h / 2, size_w, size_h)
        } else if dy > 0 {
            Rect::new(pcx - size_w / 2, parent.y + parent.h + gap, size_w, size_h)
        } else {
            Rect::new(pcx - size_w / 2, parent.y - gap - size_h, size_w, size_h)
        };

        if candidate.x < 1
            || candidate.y < 1
            || candidate.x + candidate.w >= def.width as i32 - 1
            || candidate.y + candidate.h >= def.height as i32 - 1
        {
            continue;
        }
        if rooms
            .iter()
            .any(|room| candidate.intersects(&room.area, 2))
        {
            continue;
        }
        rooms.push(Placement {
            area: candidate,
            parent: Some(parent_idx),
        });
    }

    // Rightmost room hosts the boss; grow it to at least 12x12 in place.
    let boss_idx = rooms
        .iter()
        .enumerate()
        .max_by_key(|(_, room)| room.area.x + room.area.w)
        .map(|(i, _)| i)
        .unwrap_or(0);
    if boss_idx != 0 {
        let area = &mut rooms[boss_idx].area;
        if area.w < 12 {
            area.x = (area.x - (12 - area.w) / 2).max(1);
            area.w = 12;
        }
        if area.h < 12 {
            area.y = (area.y - (12 - area.h) / 2).max(1);
            area.h = 12;
        }
        if area.x + area.w >= def.width as i32 - 1 {
            area.x = def.width as i32 - 1 - area.w;
        }
        if area.y + area.h >= def.height as i32 - 1 {
            area.y = def.height as i32 - 1 - area.h;
        }
    }

    // Carve floors.
    for (idx, room) in rooms.iter().enumerate() {
        let tile = if idx == boss_idx && idx != 0 {
            Tile::BossFloor
        } else {
            Tile::Floor
        };
        fill(&mut map, room.area, tile);
    }

    // Corridors between each room and its parent, carved after floors so a
    // corridor crossing a room leaves the room tile in place.
    for idx in 1..rooms.len() {
        let parent = rooms[idx].parent.unwrap_or(0);
        let (ax, ay) = rooms[idx].area.center();
        let (bx, by) = rooms[parent].area.center();
        carve_corridor(&mut map, ax, ay, bx, by);
    }

    // Start room interior becomes the arrival pad.
    let interior = Rect::new(
        start.x + 1,
        start.y + 1,
        (start.w - 2).max(1),
        (start.h - 2).max(1),
    );
    fill(&mut map, interior, Tile::Spawn);

    // Spawn regions: boss room gets one slow boss region and one guardian
    // region; every other non-start room gets minions plus guardians.
    let mut regions = Vec::new();
    for (idx, room) in rooms.iter().enumerate() {
        if idx == 0 {
            continue;
        }
        if idx == boss_idx {
            regions.push(SpawnRegion {
                area: room.area,
                weights: vec![(def.boss.clone(), 1.0)],
                max_alive: 1,
                rate: 0.02,
            });
            regions.push(SpawnRegion {
                area: room.area,
                weights: vec![(def.guardian.clone(), 1.0)],
                max_alive: 3,
                rate: 0.1,
            });
        } else {
            regions.push(SpawnRegion {
                area: room.area,
                weights: vec![(def.minion.clone(), 3.0), (def.guardian.clone(), 1.0)],
                max_alive: 5,
                rate: 0.25,
            });
        }
    }
    map.regions = regions;

    let (bx, by) = rooms[boss_idx].area.center();
    let (sx, sy) = rooms[0].area.center();
    DungeonLayout {
        map,
        boss_room_center: Vec2::new(bx as f32 + 0.5, by as f32 + 0.5),
        entry_point: Vec2::new(sx as f32 + 0.5, sy as f32 + 0.5),
    }
}

fn fill(map: &mut TileMap, area: Rect, tile: Tile) {
    for y in area.y..area.y + area.h {
        for x in area.x..area.x + area.w {
            map.set_tile(x, y, tile);
        }
    }
}

/// 2-tile-wide L corridor: horizontal leg first, then vertical.
fn carve_corridor(map: &mut TileMap, ax: i32, ay: i32, bx: i32, by: i32) {
    let (x0, x1) = (ax.min(bx), ax.max(bx));
    for x in x0..=x1 {
        carve_floor(map, x, ay);
        carve_floor(map, x, ay + 1);
    }
    let (y0, y1) = (ay.min(by), ay.max(by));
    for y in y0..=y1 {
        carve_floor(map, bx, y);
        carve_floor(map, bx + 1, y);
    }
}

fn carve_floor(map: &mut TileMap, x: i32, y: i32) {
    if map.tile(x, y) == Tile::Void {
        map.set_tile(x, y, Tile::Floor);
    }
}
