//! Entity kinds and the identity/geometry primitives they share.
//!
//! Every live entity carries a globally unique opaque id and belongs to
//! exactly one instance's kind-appropriate container. References between
//! entities are ids, never pointers; a dangling id simply fails its lookup.

use realm_shared::Vec2;
use uuid::Uuid;

pub mod enemy;
pub mod loot;
pub mod player;
pub mod portal;
pub mod projectile;

/// Opaque 128-bit entity id.
pub type EntityId = Uuid;

pub fn new_entity_id() -> EntityId {
    Uuid::new_v4()
}

/// Which army a projectile fights for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Player,
    Enemy,
}

/// Circle-circle overlap, the collision primitive for all combat.
pub fn circles_overlap(a: Vec2, ra: f32, b: Vec2, rb: f32) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    dx * dx + dy * dy < (ra + rb) * (ra + rb)
}

/// The static chest inside a vault instance.
#[derive(Debug, Clone)]
pub struct VaultChest {
    pub id: EntityId,
    pub pos: Vec2,
    pub radius: f32,
}

impl VaultChest {
    pub fn new(pos: Vec2) -> VaultChest {
        VaultChest {
            id: new_entity_id(),
            pos,
            radius: 0.5,
        }
    }
}
