//! The player entity: derived stats, regen, buffs, movement and combat
//! actions.
//!
//! All durable character fields round-trip through the persistence store;
//! everything else (buffs, cooldowns, regen accumulators, the latest input)
//! is session-lifetime only and rebuilt on login.

use std::f32::consts::PI;

use rand::Rng;
use serde::{Deserialize, Serialize};

use realm_shared::{Vec2, EQUIP_SLOTS, INVENTORY_SIZE, MAX_LEVEL, PLAYER_RADIUS};

use crate::content::{exp_for_level, ContentTables, ItemKind, StatKind};
use crate::entity::{new_entity_id, EntityId, Side};
use crate::map::TileMap;

/// The six base stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBlock {
    pub attack: i32,
    pub defense: i32,
    pub speed: i32,
    pub dexterity: i32,
    pub vitality: i32,
    pub wisdom: i32,
}

impl StatBlock {
    pub fn stat(&self, kind: StatKind) -> i32 {
        match kind {
            StatKind::Attack => self.attack,
            StatKind::Defense => self.defense,
            StatKind::Speed => self.speed,
            StatKind::Dexterity => self.dexterity,
            StatKind::Vitality => self.vitality,
            StatKind::Wisdom => self.wisdom,
        }
    }

    pub fn add(&mut self, other: &StatBlock) {
        self.attack += other.attack;
        self.defense += other.defense;
        self.speed += other.speed;
        self.dexterity += other.dexterity;
        self.vitality += other.vitality;
        self.wisdom += other.wisdom;
    }
}

/// Lifetime achievement counters, persisted with the character.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LifetimeCounters {
    pub damage_dealt: i64,
    pub damage_taken: i64,
    pub shots_fired: i64,
    pub abilities_used: i64,
    pub enemies_killed: i64,
    pub dungeons_cleared: i64,
    pub seconds_played: f64,
}

/// A temporary stat modifier from an ability.
#[derive(Debug, Clone, Copy)]
pub struct Buff {
    pub stat: StatKind,
    pub amount: i32,
    pub expires_at: f64,
}

/// The most recent sanitized client input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerInput {
    pub move_dir: Vec2,
    pub aim: f32,
    pub shooting: bool,
}

/// A projectile the instance should spawn on behalf of a shooter.
#[derive(Debug, Clone)]
pub struct ProjectileSpawn {
    pub owner: EntityId,
    pub side: Side,
    pub projectile: String,
    pub pos: Vec2,
    pub angle: f32,
    pub damage: i32,
    pub pierce: bool,
    pub lifetime: f32,
}

#[derive(Debug)]
pub struct Player {
    pub id: EntityId,
    pub character_id: uuid::Uuid,
    pub account_id: uuid::Uuid,
    pub name: String,
    pub class_id: String,
    pub pos: Vec2,
    pub radius: f32,
    pub level: u32,
    pub exp: i64,
    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,
    pub stats: StatBlock,
    /// weapon, ability, armor, ring.
    pub equipment: [Option<String>; EQUIP_SLOTS],
    pub inventory: [Option<String>; INVENTORY_SIZE],
    pub last_hit_at: f64,
    pub counters: LifetimeCounters,
    pub buffs: Vec<Buff>,
    pub last_input: PlayerInput,
    /// Non-owning back-reference to the world this player resides in.
    pub instance_id: String,
    pub last_shot_at: f64,
    pub last_ability_at: f64,
    hp_regen_acc: f32,
    mp_regen_acc: f32,
    pub removed: bool,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        character_id: uuid::Uuid,
        account_id: uuid::Uuid,
        name: String,
        class_id: String,
        level: u32,
        exp: i64,
        hp: i32,
        mp: i32,
        stats: StatBlock,
        equipment: [Option<String>; EQUIP_SLOTS],
        inventory: [Option<String>; INVENTORY_SIZE],
        counters: LifetimeCounters,
        content: &ContentTables,
    ) -> Player {
        let class = content.class(&class_id);
        let (base_hp, base_mp) = class
            .map(|c| {
                (
                    c.base_hp + c.hp_per_level * (level as i32 - 1),
                    c.base_mp + c.mp_per_level * (level as i32 - 1),
                )
            })
            .unwrap_or((100, 100));
        let mut player = Player {
            id: new_entity_id(),
            character_id,
            account_id,
            name,
            class_id,
            pos: Vec2::ZERO,
            radius: PLAYER_RADIUS,
            level,
            exp,
            hp,
            max_hp: base_hp,
            mp,
            max_mp: base_mp,
            stats,
            equipment,
            inventory,
            last_hit_at: 0.0,
            counters,
            buffs: Vec::new(),
            last_input: PlayerInput::default(),
            instance_id: String::new(),
            last_shot_at: f64::NEG_INFINITY,
            last_ability_at: f64::NEG_INFINITY,
            hp_regen_acc: 0.0,
            mp_regen_acc: 0.0,
            removed: false,
        };
        player.clamp_vitals(content);
        player
    }

    /// Base stat plus worn equipment plus live buffs.
    pub fn effective_stat(&self, kind: StatKind, content: &ContentTables) -> i32 {
        let mut value = self.stats.stat(kind);
        for slot in self.equipment.iter().flatten() {
            if let Some(item) = content.item(slot) {
                value += item.bonuses().stat(kind);
            }
        }
        for buff in &self.buffs {
            if buff.stat == kind {
                value += buff.amount;
            }
        }
        value
    }

    /// Movement speed in tiles per second.
    pub fn effective_speed(&self, content: &ContentTables) -> f32 {
        4.0 + self.effective_stat(StatKind::Speed, content) as f32 * 0.1
    }

    pub fn effective_max_hp(&self, content: &ContentTables) -> i32 {
        let bonus: i32 = self
            .equipment
            .iter()
            .flatten()
            .filter_map(|slot| content.item(slot))
            .map(|item| item.bonuses().max_hp)
            .sum();
        self.max_hp + bonus
    }

    pub fn effective_max_mp(&self, content: &ContentTables) -> i32 {
        let bonus: i32 = self
            .equipment
            .iter()
            .flatten()
            .filter_map(|slot| content.item(slot))
            .map(|item| item.bonuses().max_mp)
            .sum();
        self.max_mp + bonus
    }

    /// Clamps hp/mp to the current effective maxima. Must run after any
    /// equipment change in the armor or ring slot.
    pub fn clamp_vitals(&mut self, content: &ContentTables) {
        self.hp = self.hp.clamp(0, self.effective_max_hp(content));
        self.mp = self.mp.clamp(0, self.effective_max_mp(content));
    }

    fn drop_expired_buffs(&mut self, now: f64) {
        self.buffs.retain(|buff| buff.expires_at > now);
    }

    /// Per-tick update: buff decay, input-directed movement with wall-slide,
    /// and regen. Safe zones force 20%-of-max regen per second instead of
    /// the stat-driven rates.
    pub fn update(
        &mut self,
        dt: f32,
        now: f64,
        map: &TileMap,
        safe_zone: bool,
        content: &ContentTables,
    ) {
        self.drop_expired_buffs(now);
        self.counters.seconds_played += dt as f64;

        let dir = self.last_input.move_dir;
        if dir.length() > 0.0 {
            let step = dir.normalize().scale(self.effective_speed(content) * dt);
            let target = self.pos + step;
            if map.can_move_to(target, self.radius) {
                self.pos = target;
            } else {
                // Wall-slide: try each axis on its own.
                let x_only = Vec2::new(self.pos.x + step.x, self.pos.y);
                let y_only = Vec2::new(self.pos.x, self.pos.y + step.y);
                if map.can_move_to(x_only, self.radius) {
                    self.pos = x_only;
                } else if map.can_move_to(y_only, self.radius) {
                    self.pos = y_only;
                }
            }
        }

        let max_hp = self.effective_max_hp(content);
        let max_mp = self.effective_max_mp(content);
        if safe_zone {
            self.hp_regen_acc += max_hp as f32 * 0.2 * dt;
            self.mp_regen_acc += max_mp as f32 * 0.2 * dt;
        } else {
            let vit = self.effective_stat(StatKind::Vitality, content) as f32;
            let wis = self.effective_stat(StatKind::Wisdom, content) as f32;
            self.hp_regen_acc += (1.0 + vit * 0.12) * dt;
            self.mp_regen_acc += (0.5 + wis * 0.06) * dt;
        }
        let hp_gain = self.hp_regen_acc.floor() as i32;
        if hp_gain > 0 {
            self.hp_regen_acc -= hp_gain as f32;
            self.hp = (self.hp + hp_gain).min(max_hp);
        }
        let mp_gain = self.mp_regen_acc.floor() as i32;
        if mp_gain > 0 {
            self.mp_regen_acc -= mp_gain as f32;
            self.mp = (self.mp + mp_gain).min(max_mp);
        }
    }

    /// Fires the equipped weapon if its cooldown has elapsed. Returns the
    /// projectile fan to spawn.
    pub fn try_shoot(
        &mut self,
        aim: f32,
        now: f64,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) -> Vec<ProjectileSpawn> {
        let weapon = match self.equipment[0]
            .as_deref()
            .and_then(|id| content.item(id))
            .and_then(|item| item.as_weapon())
        {
            Some(weapon) => weapon,
            None => return Vec::new(),
        };
        if now - self.last_shot_at < 1.0 / weapon.rate_of_fire as f64 {
            return Vec::new();
        }
        self.last_shot_at = now;
        self.counters.shots_fired += 1;

        let speed = content
            .projectile(&weapon.projectile)
            .map(|p| p.speed)
            .unwrap_or(10.0);
        let lifetime = weapon.range / speed;
        let attack_bonus = self.effective_stat(StatKind::Attack, content) as f32;
        let gap = weapon.arc_gap_deg * PI / 180.0;
        realm_shared::fan_angles(aim, weapon.num_projectiles, gap)
            .into_iter()
            .map(|angle| {
                let raw = rng.gen_range(weapon.min_damage..=weapon.max_damage) as f32;
                ProjectileSpawn {
                    owner: self.id,
                    side: Side::Player,
                    projectile: weapon.projectile.clone(),
                    pos: self.pos,
                    angle,
                    damage: (raw + attack_bonus * 0.5).floor() as i32,
                    pierce: weapon.pierce,
                    lifetime,
                }
            })
            .collect()
    }

    /// Checks the ability gate (mp cost and cooldown) and pays the cost.
    /// Returns the ability item id when it may fire.
    pub fn try_use_ability(&mut self, now: f64, content: &ContentTables) -> Option<String> {
        let ability_id = self.equipment[1].clone()?;
        let ability = content.item(&ability_id)?.as_ability()?.clone();
        if now - self.last_ability_at < ability.cooldown as f64 {
            return None;
        }
        if self.mp < ability.mp_cost {
            return None;
        }
        self.mp -= ability.mp_cost;
        self.last_ability_at = now;
        self.counters.abilities_used += 1;
        Some(ability_id)
    }

    /// Banks experience and applies any level-ups. Returns the number of
    /// levels gained.
    pub fn gain_exp(&mut self, amount: i64, content: &ContentTables) -> u32 {
        self.exp += amount;
        let mut gained = 0;
        while self.level < MAX_LEVEL && self.exp >= exp_for_level(self.level + 1) {
            self.level += 1;
            gained += 1;
            self.exp = 0;
            if let Some(class) = content.class(&self.class_id) {
                self.stats.add(&class.growth_per_level);
                self.max_hp += class.hp_per_level;
                self.max_mp += class.mp_per_level;
            }
            // Level-ups refill to the new maxima.
            self.hp = self.effective_max_hp(content);
            self.mp = self.effective_max_mp(content);
        }
        gained
    }

    /// Swaps two slots in the combined equipment+inventory layout.
    ///
    /// Slots 0..3 are equipment (weapon, ability, armor, ring), 4..11 are
    /// inventory. Rejects self-swaps and class-incompatible placements;
    /// clamps vitals afterwards. Returns false when nothing changed.
    pub fn swap_items(&mut self, from: u8, to: u8, content: &ContentTables) -> bool {
        let total = (EQUIP_SLOTS + INVENTORY_SIZE) as u8;
        if from >= total || to >= total || from == to {
            return false;
        }
        let item_at = |player: &Player, slot: u8| -> Option<String> {
            if (slot as usize) < EQUIP_SLOTS {
                player.equipment[slot as usize].clone()
            } else {
                player.inventory[slot as usize - EQUIP_SLOTS].clone()
            }
        };
        let a = item_at(self, from);
        let b = item_at(self, to);
        if !self.slot_accepts(from, b.as_deref(), content)
            || !self.slot_accepts(to, a.as_deref(), content)
        {
            return false;
        }
        self.put(from, b);
        self.put(to, a);
        self.clamp_vitals(content);
        true
    }

    fn put(&mut self, slot: u8, item: Option<String>) {
        if (slot as usize) < EQUIP_SLOTS {
            self.equipment[slot as usize] = item;
        } else {
            self.inventory[slot as usize - EQUIP_SLOTS] = item;
        }
    }

    /// Equipment slot compatibility; inventory slots accept anything.
    fn slot_accepts(&self, slot: u8, item: Option<&str>, content: &ContentTables) -> bool {
        if (slot as usize) >= EQUIP_SLOTS {
            return true;
        }
        let item_id = match item {
            Some(id) => id,
            // Unequipping into an empty slot is always fine.
            None => return true,
        };
        let def = match content.item(item_id) {
            Some(def) => def,
            None => return false,
        };
        let class = match content.class(&self.class_id) {
            Some(class) => class,
            None => return false,
        };
        match (slot, &def.kind) {
            (0, ItemKind::Weapon(w)) => w.weapon_type == class.weapon_type,
            (1, ItemKind::Ability(a)) => a.ability_type == class.ability_type,
            (2, ItemKind::Armor(a)) => a.armor_type == class.armor_type,
            (3, ItemKind::Ring(_)) => true,
            _ => false,
        }
    }

    /// First empty inventory slot, if any.
    pub fn free_inventory_slot(&self) -> Option<usize> {
        self.inventory.iter().position(|slot| slot.is_none())
    }
}
