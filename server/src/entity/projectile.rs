//! Projectiles: ballistic motion, lifetime expiry, wall kill and hit-set
//! bookkeeping.

use std::collections::HashSet;

use realm_shared::Vec2;

use crate::entity::player::ProjectileSpawn;
use crate::entity::{new_entity_id, EntityId, Side};
use crate::map::TileMap;

/// Upper bound on tracked hits for very long-lived piercing projectiles.
const MAX_TRACKED_HITS: usize = 64;

#[derive(Debug)]
pub struct Projectile {
    pub id: EntityId,
    pub owner: EntityId,
    pub side: Side,
    pub def_id: String,
    pub pos: Vec2,
    pub vel: Vec2,
    pub radius: f32,
    pub damage: i32,
    pub pierce: bool,
    pub lifetime: f32,
    pub age: f32,
    hit: HashSet<EntityId>,
    pub removed: bool,
}

impl Projectile {
    pub fn from_spawn(spawn: ProjectileSpawn, speed: f32, radius: f32) -> Projectile {
        Projectile {
            id: new_entity_id(),
            owner: spawn.owner,
            side: spawn.side,
            def_id: spawn.projectile,
            pos: spawn.pos,
            vel: Vec2::from_angle(spawn.angle).scale(speed),
            radius,
            damage: spawn.damage,
            pierce: spawn.pierce,
            lifetime: spawn.lifetime,
            age: 0.0,
            hit: HashSet::new(),
            removed: false,
        }
    }

    /// Advances the projectile; it dies on lifetime exhaustion or on the
    /// first non-walkable tile it enters.
    pub fn update(&mut self, dt: f32, map: &TileMap) {
        self.pos = self.pos + self.vel.scale(dt);
        self.age += dt;
        if self.age >= self.lifetime || !map.is_walkable_at(self.pos.x, self.pos.y) {
            self.removed = true;
        }
    }

    pub fn has_hit(&self, target: EntityId) -> bool {
        self.hit.contains(&target)
    }

    /// Records a hit. Non-piercing projectiles die with their first target;
    /// piercing ones stop tracking (and thus hitting) past the cap.
    pub fn register_hit(&mut self, target: EntityId) {
        if self.hit.len() < MAX_TRACKED_HITS {
            self.hit.insert(target);
        }
        if !self.pierce {
            self.removed = true;
        }
    }

    pub fn hit_count(&self) -> usize {
        self.hit.len()
    }

    /// A saturated hit set means no further targets may be damaged.
    pub fn hit_set_full(&self) -> bool {
        self.hit.len() >= MAX_TRACKED_HITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_shared::Tile;
    use uuid::Uuid;

    fn spawn() -> ProjectileSpawn {
        ProjectileSpawn {
            owner: Uuid::new_v4(),
            side: Side::Player,
            projectile: "bolt_small".to_string(),
            pos: Vec2::new(2.0, 2.0),
            angle: 0.0,
            damage: 10,
            pierce: false,
            lifetime: 1.0,
        }
    }

    #[test]
    fn test_lifetime_expiry() {
        let map = TileMap::filled(50, 50, Tile::Floor);
        let mut p = Projectile::from_spawn(spawn(), 10.0, 0.15);
        for _ in 0..19 {
            p.update(0.05, &map);
            assert!(!p.removed);
        }
        p.update(0.05, &map);
        assert!(p.removed);
    }

    #[test]
    fn test_wall_kill() {
        let mut map = TileMap::filled(50, 50, Tile::Floor);
        map.set_tile(4, 2, Tile::Wall);
        let mut p = Projectile::from_spawn(spawn(), 10.0, 0.15);
        let mut steps = 0;
        while !p.removed && steps < 100 {
            p.update(0.05, &map);
            steps += 1;
        }
        assert!(p.removed);
        // Died inside the wall tile, well before lifetime ran out.
        assert!(p.age < 1.0);
        assert!(p.pos.x >= 4.0 && p.pos.x < 5.0);
    }

    #[test]
    fn test_non_piercing_dies_on_first_hit() {
        let mut p = Projectile::from_spawn(spawn(), 10.0, 0.15);
        let target = Uuid::new_v4();
        p.register_hit(target);
        assert!(p.removed);
        assert_eq!(p.hit_count(), 1);
        assert!(p.has_hit(target));
    }

    #[test]
    fn test_pierce_tracks_multiple_hits() {
        let mut s = spawn();
        s.pierce = true;
        let mut p = Projectile::from_spawn(s, 10.0, 0.15);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        p.register_hit(a);
        p.register_hit(b);
        assert!(!p.removed);
        assert!(p.has_hit(a) && p.has_hit(b));
        assert_eq!(p.hit_count(), 2);
    }

    #[test]
    fn test_hit_set_is_bounded() {
        let mut s = spawn();
        s.pierce = true;
        let mut p = Projectile::from_spawn(s, 10.0, 0.15);
        for _ in 0..200 {
            p.register_hit(Uuid::new_v4());
        }
        assert_eq!(p.hit_count(), MAX_TRACKED_HITS);
        assert!(p.hit_set_full());
    }
}
