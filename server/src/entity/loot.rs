//! Loot bags: contents, despawn timer, soulbound ownership.

use realm_shared::Vec2;

use crate::entity::{new_entity_id, EntityId};

/// Most items one bag can hold.
pub const BAG_CAPACITY: usize = 8;

#[derive(Debug)]
pub struct LootBag {
    pub id: EntityId,
    pub pos: Vec2,
    pub radius: f32,
    items: Vec<String>,
    pub expires_at: f64,
    /// Soulbound bags always carry an owner and are replicated only to them.
    pub owner: Option<EntityId>,
    pub soulbound: bool,
    pub removed: bool,
}

impl LootBag {
    pub fn new(
        pos: Vec2,
        items: Vec<String>,
        expires_at: f64,
        owner: Option<EntityId>,
        soulbound: bool,
    ) -> LootBag {
        debug_assert!(!soulbound || owner.is_some());
        LootBag {
            id: new_entity_id(),
            pos,
            radius: 0.4,
            items,
            expires_at,
            owner,
            soulbound,
            removed: false,
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= BAG_CAPACITY
    }

    pub fn push(&mut self, item: String) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Pops the first item; an emptied bag removes itself.
    pub fn take_first(&mut self) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let item = self.items.remove(0);
        if self.items.is_empty() {
            self.removed = true;
        }
        Some(item)
    }

    /// Whether `viewer` may see or open this bag.
    pub fn visible_to(&self, viewer: EntityId) -> bool {
        !self.soulbound || self.owner == Some(viewer)
    }

    pub fn update(&mut self, now: f64) {
        if now >= self.expires_at {
            self.removed = true;
        }
    }
}
