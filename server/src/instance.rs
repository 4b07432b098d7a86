//! One game world: entity containers and the per-tick update pipeline.
//!
//! The pipeline order within a tick is fixed: entity updates, combat
//! resolution, the spawn scheduler, cleanup of remove-flagged entities, and
//! (every other tick) snapshot emission. Safe zones skip combat and spawning
//! entirely and substitute accelerated regen.
//!
//! Instances never talk to sockets. Everything that must leave the world —
//! damage events, loot announcements, death handling, dungeon requests —
//! is pushed onto an event list the orchestrator drains after `update`.

use std::collections::HashMap;

use log::{debug, warn};
use rand::Rng;

use realm_shared::protocol::{
    ChestView, EnemyView, LootView, PlayerView, PortalView, ProjectileView, ServerMessage,
};
use realm_shared::{
    InstanceKind, Vec2, AOI_RADIUS, LOOT_DESPAWN_SECS, PICKUP_RANGE, PORTAL_INTERACT_RANGE,
    SOULBOUND_THRESHOLD, VAULT_CHEST_INTERACT_RANGE,
};

use crate::content::{AbilityEffect, ContentTables};
use crate::entity::enemy::Enemy;
use crate::entity::loot::LootBag;
use crate::entity::player::{Player, ProjectileSpawn};
use crate::entity::portal::Portal;
use crate::entity::projectile::Projectile;
use crate::entity::{circles_overlap, EntityId, Side, VaultChest};
use crate::map::TileMap;

/// Distance below which a dropped item merges into an existing bag.
const DROP_MERGE_RANGE: f32 = 0.5;

/// Dungeon-only bookkeeping.
#[derive(Debug)]
pub struct DungeonState {
    pub boss_room_center: Vec2,
    pub source_instance: String,
    pub boss_killed: bool,
    pub initial_spawn_done: bool,
    /// First arrival's spawn, reused for everyone after.
    pub fixed_spawn: Option<Vec2>,
}

/// Something the orchestrator must act on after a tick.
#[derive(Debug)]
pub enum InstanceEvent {
    /// Deliver to one resident player's session.
    ToPlayer { player: EntityId, msg: ServerMessage },
    /// Deliver to every resident player's session.
    Broadcast { msg: ServerMessage },
    /// Deliver to resident players within the area of interest of `pos`.
    BroadcastNear { pos: Vec2, msg: ServerMessage },
    /// A player's hp reached zero; permadeath handling happens upstream.
    PlayerDied { player: EntityId, killed_by: String },
    /// A designated enemy death rolled a dungeon drop.
    OpenDungeon { dungeon: String, at: Vec2 },
    /// The dungeon boss died; a return portal should appear at `at`.
    BossKilled { at: Vec2 },
}

pub struct Instance {
    pub id: String,
    pub kind: InstanceKind,
    pub map: TileMap,
    pub safe_zone: bool,
    pub players: HashMap<EntityId, Player>,
    pub enemies: HashMap<EntityId, Enemy>,
    pub projectiles: HashMap<EntityId, Projectile>,
    pub loot: HashMap<EntityId, LootBag>,
    pub portals: HashMap<EntityId, Portal>,
    pub chests: HashMap<EntityId, VaultChest>,
    region_timers: Vec<f32>,
    pub dungeon: Option<DungeonState>,
    events: Vec<InstanceEvent>,
}

impl Instance {
    pub fn new(id: String, kind: InstanceKind, map: TileMap) -> Instance {
        let safe_zone = matches!(kind, InstanceKind::Nexus | InstanceKind::Vault);
        let region_timers = vec![0.0; map.regions.len()];
        Instance {
            id,
            kind,
            map,
            safe_zone,
            players: HashMap::new(),
            enemies: HashMap::new(),
            projectiles: HashMap::new(),
            loot: HashMap::new(),
            portals: HashMap::new(),
            chests: HashMap::new(),
            region_timers,
            dungeon: None,
            events: Vec::new(),
        }
    }

    pub fn is_empty_of_players(&self) -> bool {
        self.players.is_empty()
    }

    /// Places a player at the map's spawn. Dungeons cache the first spawn
    /// point and reuse it for later arrivals.
    pub fn add_player(&mut self, mut player: Player, rng: &mut impl Rng) -> Vec2 {
        let spawn = match self.dungeon.as_mut() {
            Some(state) => {
                let spawn = state
                    .fixed_spawn
                    .unwrap_or_else(|| self.map.choose_spawn(rng));
                state.fixed_spawn = Some(spawn);
                spawn
            }
            None => self.map.choose_spawn(rng),
        };
        player.pos = spawn;
        player.instance_id = self.id.clone();
        player.removed = false;
        self.players.insert(player.id, player);
        spawn
    }

    /// Detaches a player for the caller to persist or transfer.
    pub fn remove_player(&mut self, id: EntityId) -> Option<Player> {
        self.players.remove(&id)
    }

    /// The portal id iff the player stands within interaction range of it.
    /// Does not move the player.
    pub fn try_enter_portal(&self, player_id: EntityId, portal_id: EntityId) -> Option<&Portal> {
        let player = self.players.get(&player_id)?;
        let portal = self.portals.get(&portal_id)?;
        if portal.removed || player.pos.distance(portal.pos) > PORTAL_INTERACT_RANGE {
            return None;
        }
        Some(portal)
    }

    /// Chest the player stands next to, if any.
    pub fn chest_in_range(&self, player_id: EntityId) -> Option<&VaultChest> {
        let player = self.players.get(&player_id)?;
        self.chests
            .values()
            .find(|chest| player.pos.distance(chest.pos) <= VAULT_CHEST_INTERACT_RANGE)
    }

    /// Moves the first item of a bag into the player's first free inventory
    /// slot. Silently no-ops when out of range, on a foreign soulbound bag,
    /// or with a full inventory.
    pub fn try_pickup_loot(
        &mut self,
        player_id: EntityId,
        loot_id: EntityId,
        content: &ContentTables,
    ) -> bool {
        let player = match self.players.get_mut(&player_id) {
            Some(player) => player,
            None => return false,
        };
        let bag = match self.loot.get_mut(&loot_id) {
            Some(bag) => bag,
            None => return false,
        };
        if bag.removed || player.pos.distance(bag.pos) > PICKUP_RANGE {
            return false;
        }
        if !bag.visible_to(player_id) {
            return false;
        }
        let slot = match player.free_inventory_slot() {
            Some(slot) => slot,
            None => return false,
        };
        let item = match bag.take_first() {
            Some(item) => item,
            None => return false,
        };
        if content.item(&item).is_none() {
            warn!("bag {} held unknown item {}", loot_id, item);
        }
        player.inventory[slot] = Some(item);
        true
    }

    /// Drops an item at the player's feet, merging into a nearby bag of the
    /// same owner and soulbound flavor when one has room.
    pub fn drop_item(&mut self, player_id: EntityId, item: String, now: f64, soulbound: bool) {
        let pos = match self.players.get(&player_id) {
            Some(player) => player.pos,
            None => return,
        };
        let owner = if soulbound { Some(player_id) } else { None };
        let mergeable = self.loot.values_mut().find(|bag| {
            !bag.removed
                && bag.soulbound == soulbound
                && bag.owner == owner
                && !bag.is_full()
                && bag.pos.distance(pos) < DROP_MERGE_RANGE
        });
        if let Some(bag) = mergeable {
            bag.push(item);
            return;
        }
        let bag = LootBag::new(pos, vec![item], now + LOOT_DESPAWN_SECS, owner, soulbound);
        self.announce_bag(&bag);
        self.loot.insert(bag.id, bag);
    }

    pub fn spawn_enemy(&mut self, def_id: &str, pos: Vec2, content: &ContentTables) -> Option<EntityId> {
        let def = content.enemy(def_id)?;
        let enemy = Enemy::spawn(def, pos);
        let id = enemy.id;
        self.enemies.insert(id, enemy);
        Some(id)
    }

    pub fn spawn_projectile(&mut self, spawn: ProjectileSpawn, content: &ContentTables) {
        let (speed, radius) = content
            .projectile(&spawn.projectile)
            .map(|p| (p.speed, p.radius))
            .unwrap_or((10.0, 0.15));
        let projectile = Projectile::from_spawn(spawn, speed, radius);
        self.projectiles.insert(projectile.id, projectile);
    }

    pub fn add_portal(&mut self, portal: Portal) -> EntityId {
        let id = portal.id;
        self.portals.insert(id, portal);
        id
    }

    pub fn add_chest(&mut self, chest: VaultChest) {
        self.chests.insert(chest.id, chest);
    }

    /// Fires the player's weapon along `aim` if the cooldown allows.
    pub fn player_shoot(
        &mut self,
        player_id: EntityId,
        aim: f32,
        now: f64,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) {
        let spawns = match self.players.get_mut(&player_id) {
            Some(player) => player.try_shoot(aim, now, content, rng),
            None => return,
        };
        for spawn in spawns {
            self.spawn_projectile(spawn, content);
        }
    }

    /// Applies the player's equipped ability and broadcasts its visual.
    pub fn use_ability(
        &mut self,
        player_id: EntityId,
        now: f64,
        content: &ContentTables,
    ) {
        let (ability_id, pos, aim) = {
            let player = match self.players.get_mut(&player_id) {
                Some(player) => player,
                None => return,
            };
            let ability_id = match player.try_use_ability(now, content) {
                Some(id) => id,
                None => return,
            };
            (ability_id, player.pos, player.last_input.aim)
        };
        let effect = match content.item(&ability_id).and_then(|i| i.as_ability()) {
            Some(def) => def.effect.clone(),
            None => return,
        };

        match effect {
            AbilityEffect::Damage { amount, radius } => {
                if !self.safe_zone {
                    let mut killed = Vec::new();
                    for enemy in self.enemies.values_mut() {
                        if enemy.removed || enemy.pos.distance(pos) > radius {
                            continue;
                        }
                        let def_defense = content
                            .enemy(&enemy.def_id)
                            .map(|d| d.defense)
                            .unwrap_or(0);
                        let dealt = (amount - def_defense).max(1);
                        enemy.hp -= dealt;
                        enemy.attribute_damage(player_id, dealt as i64);
                        if let Some(player) = self.players.get_mut(&player_id) {
                            player.counters.damage_dealt += dealt as i64;
                        }
                        if enemy.hp <= 0 {
                            killed.push(enemy.id);
                        }
                    }
                    for enemy_id in killed {
                        self.on_enemy_death(enemy_id, player_id, now, content);
                    }
                }
            }
            AbilityEffect::Buff {
                stat,
                amount,
                duration,
            } => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    player.buffs.push(crate::entity::player::Buff {
                        stat,
                        amount,
                        expires_at: now + duration as f64,
                    });
                }
            }
            AbilityEffect::Heal { amount } => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    player.hp = (player.hp + amount).min(player.effective_max_hp(content));
                }
            }
            AbilityEffect::Teleport { range } => {
                if let Some(player) = self.players.get_mut(&player_id) {
                    let dir = Vec2::from_angle(aim);
                    // Walk the aim line back from max range to the first
                    // walkable landing.
                    let mut reach = range;
                    while reach > 0.0 {
                        let dest = player.pos + dir.scale(reach);
                        if self.map.can_move_to(dest, player.radius) {
                            player.pos = dest;
                            break;
                        }
                        reach -= 0.5;
                    }
                }
            }
        }

        self.events.push(InstanceEvent::Broadcast {
            msg: ServerMessage::AbilityEffect {
                player: player_id,
                ability: ability_id,
                x: pos.x,
                y: pos.y,
            },
        });
    }

    /// Runs one simulation step and returns the events it produced.
    pub fn update(
        &mut self,
        dt: f32,
        now: f64,
        tick: u64,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) -> Vec<InstanceEvent> {
        self.tick_entities(dt, now, content, rng);
        if !self.safe_zone {
            self.resolve_combat(now, content);
            self.run_spawns(dt, content, rng);
        }
        self.cleanup();
        if tick % 2 == 0 {
            self.emit_snapshots(tick, content);
        }
        std::mem::take(&mut self.events)
    }

    fn tick_entities(&mut self, dt: f32, now: f64, content: &ContentTables, rng: &mut impl Rng) {
        let mut spawns: Vec<ProjectileSpawn> = Vec::new();
        for player in self.players.values_mut() {
            player.update(dt, now, &self.map, self.safe_zone, content);
            if player.last_input.shooting {
                spawns.extend(player.try_shoot(player.last_input.aim, now, content, rng));
            }
        }
        {
            let players = &self.players;
            for enemy in self.enemies.values_mut() {
                spawns.extend(enemy.update(dt, now, &self.map, players, content, rng));
            }
        }
        for spawn in spawns {
            self.spawn_projectile(spawn, content);
        }
        for projectile in self.projectiles.values_mut() {
            projectile.update(dt, &self.map);
        }
        for bag in self.loot.values_mut() {
            bag.update(now);
        }
        for portal in self.portals.values_mut() {
            portal.update(now);
        }
    }

    /// Projectile-versus-opposed-side overlap tests plus damage application.
    /// Iteration order across projectiles does not affect outcomes beyond
    /// same-tick tie-breaks; the hit set prevents double counting.
    fn resolve_combat(&mut self, now: f64, content: &ContentTables) {
        let projectile_ids: Vec<EntityId> = self.projectiles.keys().copied().collect();
        let mut dead_enemies: Vec<(EntityId, EntityId)> = Vec::new();
        let mut dead_players: Vec<(EntityId, String)> = Vec::new();

        for pid in projectile_ids {
            let (side, pos, radius, damage, owner) = match self.projectiles.get(&pid) {
                Some(p) if !p.removed && !p.hit_set_full() => {
                    (p.side, p.pos, p.radius, p.damage, p.owner)
                }
                _ => continue,
            };

            match side {
                Side::Enemy => {
                    let victims: Vec<EntityId> = self
                        .players
                        .values()
                        .filter(|player| {
                            !player.removed
                                && circles_overlap(pos, radius, player.pos, player.radius)
                        })
                        .map(|player| player.id)
                        .collect();
                    for victim in victims {
                        let projectile = match self.projectiles.get_mut(&pid) {
                            Some(p) if !p.removed => p,
                            _ => break,
                        };
                        if projectile.has_hit(victim) {
                            continue;
                        }
                        projectile.register_hit(victim);
                        let player = match self.players.get_mut(&victim) {
                            Some(player) => player,
                            None => continue,
                        };
                        let defense =
                            player.effective_stat(crate::content::StatKind::Defense, content);
                        // Minimum 15% bleed-through.
                        let dealt =
                            ((damage as f32 * 0.15).floor() as i32).max(damage - defense);
                        player.hp -= dealt;
                        player.last_hit_at = now;
                        player.counters.damage_taken += dealt as i64;
                        self.events.push(InstanceEvent::ToPlayer {
                            player: victim,
                            msg: ServerMessage::Damage {
                                target: victim,
                                amount: dealt,
                            },
                        });
                        if player.hp <= 0 {
                            player.hp = 0;
                            player.removed = true;
                            let killer = self
                                .projectiles
                                .get(&pid)
                                .map(|p| p.owner)
                                .and_then(|owner| self.enemies.get(&owner))
                                .and_then(|enemy| content.enemy(&enemy.def_id))
                                .map(|def| def.name.clone())
                                .unwrap_or_else(|| "the wilds".to_string());
                            dead_players.push((victim, killer));
                        }
                    }
                }
                Side::Player => {
                    let victims: Vec<EntityId> = self
                        .enemies
                        .values()
                        .filter(|enemy| {
                            !enemy.removed
                                && circles_overlap(pos, radius, enemy.pos, enemy.radius)
                        })
                        .map(|enemy| enemy.id)
                        .collect();
                    for victim in victims {
                        let projectile = match self.projectiles.get_mut(&pid) {
                            Some(p) if !p.removed => p,
                            _ => break,
                        };
                        if projectile.has_hit(victim) {
                            continue;
                        }
                        projectile.register_hit(victim);
                        let enemy = match self.enemies.get_mut(&victim) {
                            Some(enemy) => enemy,
                            None => continue,
                        };
                        let defense = content
                            .enemy(&enemy.def_id)
                            .map(|def| def.defense)
                            .unwrap_or(0);
                        let dealt = (damage - defense).max(1);
                        enemy.hp -= dealt;
                        enemy.attribute_damage(owner, dealt as i64);
                        let enemy_pos = enemy.pos;
                        if let Some(shooter) = self.players.get_mut(&owner) {
                            shooter.counters.damage_dealt += dealt as i64;
                        }
                        self.events.push(InstanceEvent::BroadcastNear {
                            pos: enemy_pos,
                            msg: ServerMessage::Damage {
                                target: victim,
                                amount: dealt,
                            },
                        });
                        if enemy.hp <= 0 {
                            dead_enemies.push((victim, owner));
                        }
                    }
                }
            }
        }

        for (enemy_id, killer) in dead_enemies {
            self.on_enemy_death(enemy_id, killer, now, content);
        }
        for (player_id, killer) in dead_players {
            self.events.push(InstanceEvent::PlayerDied {
                player: player_id,
                killed_by: killer,
            });
        }
    }

    /// Death handling: xp to the killer, loot attribution, dungeon drops
    /// and boss latching.
    fn on_enemy_death(
        &mut self,
        enemy_id: EntityId,
        killer: EntityId,
        now: f64,
        content: &ContentTables,
    ) {
        let enemy = match self.enemies.get_mut(&enemy_id) {
            Some(enemy) if !enemy.removed => enemy,
            _ => return,
        };
        enemy.removed = true;
        let death_pos = enemy.pos;
        let def = match content.enemy(&enemy.def_id) {
            Some(def) => def,
            None => return,
        };
        let qualified = enemy.qualifying_players(SOULBOUND_THRESHOLD);

        if let Some(player) = self.players.get_mut(&killer) {
            player.counters.enemies_killed += 1;
            let levels = player.gain_exp(def.xp as i64, content);
            if levels > 0 {
                let msg = ServerMessage::LevelUp {
                    level: player.level,
                    max_hp: player.effective_max_hp(content),
                    max_mp: player.effective_max_mp(content),
                };
                self.events.push(InstanceEvent::ToPlayer {
                    player: killer,
                    msg,
                });
            }
        }

        // Independent loot rolls, split into one public bag and one private
        // bag per qualifying player.
        let mut rng = rand::thread_rng();
        let mut public_items = Vec::new();
        let mut soulbound_items = Vec::new();
        for entry in &def.loot {
            if !rng.gen_bool(entry.chance.clamp(0.0, 1.0)) {
                continue;
            }
            let soulbound = content
                .item(&entry.item)
                .map(|item| item.soulbound)
                .unwrap_or(false);
            if soulbound {
                soulbound_items.push(entry.item.clone());
            } else {
                public_items.push(entry.item.clone());
            }
        }
        if !public_items.is_empty() {
            let bag = LootBag::new(
                death_pos,
                public_items,
                now + LOOT_DESPAWN_SECS,
                None,
                false,
            );
            self.announce_bag(&bag);
            self.loot.insert(bag.id, bag);
        }
        if !soulbound_items.is_empty() {
            for player_id in &qualified {
                let bag = LootBag::new(
                    death_pos,
                    soulbound_items.clone(),
                    now + LOOT_DESPAWN_SECS,
                    Some(*player_id),
                    true,
                );
                self.announce_bag(&bag);
                self.loot.insert(bag.id, bag);
            }
        }

        if let Some((dungeon, chance)) = &def.opens_dungeon {
            if rng.gen_bool(*chance) {
                self.events.push(InstanceEvent::OpenDungeon {
                    dungeon: dungeon.clone(),
                    at: death_pos,
                });
            }
        }

        if def.is_boss {
            if let Some(state) = self.dungeon.as_mut() {
                if !state.boss_killed {
                    state.boss_killed = true;
                    for player in self.players.values_mut() {
                        player.counters.dungeons_cleared += 1;
                    }
                    self.events.push(InstanceEvent::BossKilled { at: death_pos });
                }
            }
        }
    }

    fn announce_bag(&mut self, bag: &LootBag) {
        let view = LootView {
            id: bag.id,
            x: bag.pos.x,
            y: bag.pos.y,
            items: bag.items().to_vec(),
        };
        let msg = ServerMessage::LootSpawn { bag: view };
        match bag.owner {
            Some(owner) if bag.soulbound => {
                self.events.push(InstanceEvent::ToPlayer { player: owner, msg });
            }
            _ => {
                self.events.push(InstanceEvent::BroadcastNear {
                    pos: bag.pos,
                    msg,
                });
            }
        }
    }

    /// Region spawn scheduler. Dungeons go inert after the initial bulk
    /// spawn; safe zones never reach this.
    fn run_spawns(&mut self, dt: f32, content: &ContentTables, rng: &mut impl Rng) {
        if let Some(state) = &self.dungeon {
            if state.initial_spawn_done {
                return;
            }
        }
        for idx in 0..self.map.regions.len() {
            self.region_timers[idx] += dt;
            let region = &self.map.regions[idx];
            if region.rate <= 0.0 || self.region_timers[idx] < 1.0 / region.rate {
                continue;
            }
            self.region_timers[idx] = 0.0;
            let population = self
                .enemies
                .values()
                .filter(|enemy| !enemy.removed && region.area.contains_point(enemy.pos.x, enemy.pos.y))
                .count();
            if population >= region.max_alive {
                continue;
            }
            let area = region.area;
            let pick = region.pick_enemy(rng).map(|s| s.to_string());
            if let (Some(pos), Some(def_id)) = (self.map.random_walkable_in(area, rng), pick) {
                self.spawn_enemy(&def_id, pos, content);
            }
        }
    }

    /// Populates a fresh dungeon in one sweep, then freezes the scheduler.
    pub fn initial_dungeon_spawn(&mut self, content: &ContentTables, rng: &mut impl Rng) {
        for idx in 0..self.map.regions.len() {
            let region = self.map.regions[idx].clone();
            for _ in 0..region.max_alive {
                if let (Some(pos), Some(def_id)) = (
                    self.map.random_walkable_in(region.area, rng),
                    region.pick_enemy(rng).map(|s| s.to_string()),
                ) {
                    self.spawn_enemy(&def_id, pos, content);
                }
            }
        }
        if let Some(state) = self.dungeon.as_mut() {
            state.initial_spawn_done = true;
        }
        debug!("instance {} seeded {} enemies", self.id, self.enemies.len());
    }

    /// Drains remove-flagged entities from every container.
    fn cleanup(&mut self) {
        self.players.retain(|_, p| !p.removed);
        self.enemies.retain(|_, e| !e.removed);
        self.projectiles.retain(|_, p| !p.removed);
        self.loot.retain(|_, l| !l.removed);
        self.portals.retain(|_, p| !p.removed);
    }

    /// Builds one AOI-filtered snapshot per resident player.
    fn emit_snapshots(&mut self, tick: u64, content: &ContentTables) {
        let viewer_ids: Vec<EntityId> = self.players.keys().copied().collect();
        for viewer_id in viewer_ids {
            let viewer_pos = self.players[&viewer_id].pos;
            let in_aoi = |pos: Vec2| viewer_pos.distance(pos) <= AOI_RADIUS;

            let players: Vec<PlayerView> = self
                .players
                .values()
                .filter(|p| in_aoi(p.pos))
                .map(|p| PlayerView {
                    id: p.id,
                    name: p.name.clone(),
                    class_id: p.class_id.clone(),
                    x: p.pos.x,
                    y: p.pos.y,
                    hp: p.hp,
                    max_hp: p.effective_max_hp(content),
                    mp: p.mp,
                    max_mp: p.effective_max_mp(content),
                    level: p.level,
                })
                .collect();
            let enemies: Vec<EnemyView> = self
                .enemies
                .values()
                .filter(|e| in_aoi(e.pos))
                .map(|e| EnemyView {
                    id: e.id,
                    def_id: e.def_id.clone(),
                    x: e.pos.x,
                    y: e.pos.y,
                    hp: e.hp,
                    max_hp: e.max_hp,
                })
                .collect();
            let projectiles: Vec<ProjectileView> = self
                .projectiles
                .values()
                .filter(|p| in_aoi(p.pos))
                .map(|p| ProjectileView {
                    id: p.id,
                    owner: p.owner,
                    from_enemy: p.side == Side::Enemy,
                    x: p.pos.x,
                    y: p.pos.y,
                    vx: p.vel.x,
                    vy: p.vel.y,
                })
                .collect();
            let loot: Vec<LootView> = self
                .loot
                .values()
                .filter(|bag| in_aoi(bag.pos) && bag.visible_to(viewer_id))
                .map(|bag| LootView {
                    id: bag.id,
                    x: bag.pos.x,
                    y: bag.pos.y,
                    items: bag.items().to_vec(),
                })
                .collect();
            let portals: Vec<PortalView> = self
                .portals
                .values()
                .filter(|portal| in_aoi(portal.pos))
                .map(|portal| PortalView {
                    id: portal.id,
                    x: portal.pos.x,
                    y: portal.pos.y,
                    kind: portal.kind,
                    name: portal.name.clone(),
                    visible: portal.visible,
                })
                .collect();
            let chests: Vec<ChestView> = self
                .chests
                .values()
                .filter(|chest| in_aoi(chest.pos))
                .map(|chest| ChestView {
                    id: chest.id,
                    x: chest.pos.x,
                    y: chest.pos.y,
                })
                .collect();

            self.events.push(InstanceEvent::ToPlayer {
                player: viewer_id,
                msg: ServerMessage::Snapshot {
                    tick,
                    players,
                    enemies,
                    projectiles,
                    loot,
                    portals,
                    chests,
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentTables;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use realm_shared::Tile;
    use uuid::Uuid;

    fn content() -> ContentTables {
        ContentTables::builtin()
    }

    fn hostile_instance() -> Instance {
        Instance::new(
            "test-realm".to_string(),
            InstanceKind::Realm,
            TileMap::filled(40, 40, Tile::Floor),
        )
    }

    fn make_player(content: &ContentTables, name: &str) -> Player {
        let class = content.class("wizard").unwrap();
        Player::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            name.to_string(),
            "wizard".to_string(),
            1,
            0,
            class.base_hp,
            class.base_mp,
            class.base_stats,
            class.starting_equipment.clone(),
            Default::default(),
            Default::default(),
            content,
        )
    }

    fn run_ticks(
        instance: &mut Instance,
        content: &ContentTables,
        rng: &mut StdRng,
        start_tick: u64,
        ticks: u64,
    ) -> Vec<InstanceEvent> {
        let mut events = Vec::new();
        for i in 0..ticks {
            let tick = start_tick + i;
            let now = tick as f64 * 0.05;
            events.extend(instance.update(0.05, now, tick, content, rng));
        }
        events
    }

    #[test]
    fn test_projectile_kills_enemy_and_awards_xp() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(1);
        let mut instance = hostile_instance();

        let mut player = make_player(&content, "slayer");
        player.pos = Vec2::new(10.0, 10.0);
        let player_id = player.id;
        instance.players.insert(player_id, player);
        let enemy_id = instance
            .spawn_enemy("pirate", Vec2::new(11.5, 10.0), &content)
            .unwrap();
        // Keep the pirate from firing back for a deterministic check.
        instance.enemies.get_mut(&enemy_id).unwrap().hp = 1;

        // One point-blank shot.
        instance.player_shoot(player_id, 0.0, 0.0, &content, &mut rng);
        assert_eq!(instance.projectiles.len(), 1);
        let events = run_ticks(&mut instance, &content, &mut rng, 1, 4);

        assert!(instance.enemies.is_empty(), "pirate should be dead");
        let player = &instance.players[&player_id];
        assert_eq!(player.exp, 20, "xp 20 for a pirate");
        assert!(player.counters.enemies_killed == 1);
        // A damage broadcast happened near the victim.
        assert!(events.iter().any(|e| matches!(
            e,
            InstanceEvent::BroadcastNear {
                msg: ServerMessage::Damage { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_enemy_damage_respects_bleed_through() {
        let content = content();
        let mut instance = hostile_instance();
        let mut player = make_player(&content, "tank");
        player.pos = Vec2::new(10.0, 10.0);
        // Absurd defense: raw 100 still bleeds floor(100 * 0.15) = 15.
        player.stats.defense = 10_000;
        let player_id = player.id;
        let hp_before = player.hp;
        instance.players.insert(player_id, player);

        instance.spawn_projectile(
            ProjectileSpawn {
                owner: Uuid::new_v4(),
                side: Side::Enemy,
                projectile: "bolt_heavy".to_string(),
                pos: Vec2::new(10.0, 10.0),
                angle: 0.0,
                damage: 100,
                pierce: false,
                lifetime: 1.0,
            },
            &content,
        );
        instance.resolve_combat(0.0, &content);
        let player = &instance.players[&player_id];
        assert_eq!(hp_before - player.hp, 15);
    }

    #[test]
    fn test_non_piercing_projectile_hits_once() {
        let content = content();
        let mut instance = hostile_instance();
        let a = instance
            .spawn_enemy("pirate", Vec2::new(10.2, 10.0), &content)
            .unwrap();
        let b = instance
            .spawn_enemy("pirate", Vec2::new(10.4, 10.0), &content)
            .unwrap();
        instance.spawn_projectile(
            ProjectileSpawn {
                owner: Uuid::new_v4(),
                side: Side::Player,
                projectile: "bolt_small".to_string(),
                pos: Vec2::new(10.3, 10.0),
                angle: 0.0,
                damage: 10,
                pierce: false,
                lifetime: 1.0,
            },
            &content,
        );
        instance.resolve_combat(0.0, &content);
        let hp_a = instance.enemies[&a].hp;
        let hp_b = instance.enemies[&b].hp;
        let damaged = [hp_a, hp_b]
            .iter()
            .filter(|&&hp| hp < 100)
            .count();
        assert_eq!(damaged, 1, "exactly one target takes the hit");
        assert!(instance.projectiles.values().next().unwrap().removed);
    }

    #[test]
    fn test_safe_zone_skips_combat() {
        let content = content();
        let mut instance = Instance::new(
            "nexus-test".to_string(),
            InstanceKind::Nexus,
            TileMap::filled(20, 20, Tile::Floor),
        );
        assert!(instance.safe_zone);
        let mut player = make_player(&content, "idler");
        player.pos = Vec2::new(5.0, 5.0);
        let player_id = player.id;
        let hp_before;
        {
            player.hp = 10;
            hp_before = player.hp;
            instance.players.insert(player_id, player);
        }
        instance.spawn_projectile(
            ProjectileSpawn {
                owner: Uuid::new_v4(),
                side: Side::Enemy,
                projectile: "bolt_heavy".to_string(),
                pos: Vec2::new(5.0, 5.0),
                angle: 0.0,
                damage: 50,
                pierce: false,
                lifetime: 0.2,
            },
            &content,
        );
        let mut rng = StdRng::seed_from_u64(2);
        run_ticks(&mut instance, &content, &mut rng, 0, 20);
        let player = &instance.players[&player_id];
        assert!(player.hp > hp_before, "safe zone regen, no damage");
    }

    #[test]
    fn test_pickup_and_soulbound_rules() {
        let content = content();
        let mut instance = hostile_instance();
        let mut owner = make_player(&content, "owner");
        owner.pos = Vec2::new(10.0, 10.0);
        let owner_id = owner.id;
        let mut thief = make_player(&content, "thief");
        thief.pos = Vec2::new(10.3, 10.0);
        let thief_id = thief.id;
        instance.players.insert(owner_id, owner);
        instance.players.insert(thief_id, thief);

        let bag = LootBag::new(
            Vec2::new(10.1, 10.0),
            vec!["cube_edge".to_string()],
            60.0,
            Some(owner_id),
            true,
        );
        let bag_id = bag.id;
        instance.loot.insert(bag_id, bag);

        // A stranger cannot loot a soulbound bag.
        assert!(!instance.try_pickup_loot(thief_id, bag_id, &content));
        // The owner can; the emptied bag removes itself.
        assert!(instance.try_pickup_loot(owner_id, bag_id, &content));
        assert!(instance.loot[&bag_id].removed);
        let owner = &instance.players[&owner_id];
        assert_eq!(owner.inventory[0].as_deref(), Some("cube_edge"));
    }

    #[test]
    fn test_pickup_requires_range_and_space() {
        let content = content();
        let mut instance = hostile_instance();
        let mut player = make_player(&content, "greedy");
        player.pos = Vec2::new(10.0, 10.0);
        let player_id = player.id;
        instance.players.insert(player_id, player);

        let far_bag = LootBag::new(
            Vec2::new(13.0, 10.0),
            vec!["health_potion".to_string()],
            60.0,
            None,
            false,
        );
        let far_id = far_bag.id;
        instance.loot.insert(far_id, far_bag);
        assert!(!instance.try_pickup_loot(player_id, far_id, &content));

        let near_bag = LootBag::new(
            Vec2::new(10.2, 10.0),
            vec!["health_potion".to_string()],
            60.0,
            None,
            false,
        );
        let near_id = near_bag.id;
        instance.loot.insert(near_id, near_bag);
        {
            let player = instance.players.get_mut(&player_id).unwrap();
            for slot in player.inventory.iter_mut() {
                *slot = Some("pirate_doubloon".to_string());
            }
        }
        assert!(!instance.try_pickup_loot(player_id, near_id, &content));
    }

    #[test]
    fn test_drop_merges_into_nearby_bag() {
        let content = content();
        let mut instance = hostile_instance();
        let mut player = make_player(&content, "dropper");
        player.pos = Vec2::new(10.0, 10.0);
        let player_id = player.id;
        instance.players.insert(player_id, player);

        instance.drop_item(player_id, "health_potion".to_string(), 0.0, false);
        instance.drop_item(player_id, "magic_potion".to_string(), 0.0, false);
        assert_eq!(instance.loot.len(), 1, "second drop merges");
        let bag = instance.loot.values().next().unwrap();
        assert_eq!(bag.items().len(), 2);

        // A soulbound drop never merges into the public bag.
        instance.drop_item(player_id, "cube_edge".to_string(), 0.0, true);
        assert_eq!(instance.loot.len(), 2);
    }

    #[test]
    fn test_soulbound_loot_split_on_boss_death() {
        let content = content();
        let mut instance = hostile_instance();
        instance.dungeon = Some(DungeonState {
            boss_room_center: Vec2::new(20.0, 20.0),
            source_instance: "realm-main".to_string(),
            boss_killed: false,
            initial_spawn_done: true,
            fixed_spawn: None,
        });

        let mut a = make_player(&content, "carry");
        a.pos = Vec2::new(20.0, 20.0);
        let a_id = a.id;
        let mut b = make_player(&content, "leech");
        b.pos = Vec2::new(21.0, 20.0);
        let b_id = b.id;
        instance.players.insert(a_id, a);
        instance.players.insert(b_id, b);

        let boss_id = instance
            .spawn_enemy("cube_overlord", Vec2::new(22.0, 20.0), &content)
            .unwrap();
        {
            let boss = instance.enemies.get_mut(&boss_id).unwrap();
            // A dealt 20% of max hp, B dealt 3%.
            boss.attribute_damage(a_id, (boss.max_hp as f64 * 0.20) as i64);
            boss.attribute_damage(b_id, (boss.max_hp as f64 * 0.03) as i64);
            boss.hp = 0;
        }
        instance.on_enemy_death(boss_id, a_id, 0.0, &content);

        let soulbound_bags: Vec<&LootBag> =
            instance.loot.values().filter(|bag| bag.soulbound).collect();
        for bag in &soulbound_bags {
            assert_eq!(bag.owner, Some(a_id), "only the qualifying player");
        }
        assert!(soulbound_bags.len() <= 1);
        // Boss kill latched and reported.
        assert!(instance.dungeon.as_ref().unwrap().boss_killed);
        assert!(instance
            .events
            .iter()
            .any(|e| matches!(e, InstanceEvent::BossKilled { .. })));
    }

    #[test]
    fn test_snapshot_cadence_and_soulbound_filter() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(3);
        let mut instance = hostile_instance();
        let mut a = make_player(&content, "a");
        a.pos = Vec2::new(10.0, 10.0);
        let a_id = a.id;
        let mut b = make_player(&content, "b");
        b.pos = Vec2::new(11.0, 10.0);
        let b_id = b.id;
        instance.players.insert(a_id, a);
        instance.players.insert(b_id, b);
        let bag = LootBag::new(
            Vec2::new(10.5, 10.0),
            vec!["cube_edge".to_string()],
            600.0,
            Some(a_id),
            true,
        );
        instance.loot.insert(bag.id, bag);

        // Odd tick: no snapshots. Even tick: one per player.
        let events = run_ticks(&mut instance, &content, &mut rng, 1, 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e, InstanceEvent::ToPlayer { msg: ServerMessage::Snapshot { .. }, .. })));
        let events = run_ticks(&mut instance, &content, &mut rng, 2, 1);
        let snapshots: Vec<(&EntityId, &ServerMessage)> = events
            .iter()
            .filter_map(|e| match e {
                InstanceEvent::ToPlayer {
                    player,
                    msg: msg @ ServerMessage::Snapshot { .. },
                } => Some((player, msg)),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 2);
        for (viewer, msg) in snapshots {
            if let ServerMessage::Snapshot { loot, players, .. } = msg {
                assert_eq!(players.len(), 2);
                if *viewer == a_id {
                    assert_eq!(loot.len(), 1, "owner sees the soulbound bag");
                } else {
                    assert!(loot.is_empty(), "stranger must not see it");
                    assert_eq!(*viewer, b_id);
                }
            }
        }
    }

    #[test]
    fn test_aoi_filter_excludes_far_entities() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(4);
        let mut instance = hostile_instance();
        let mut viewer = make_player(&content, "viewer");
        viewer.pos = Vec2::new(5.0, 5.0);
        let viewer_id = viewer.id;
        instance.players.insert(viewer_id, viewer);
        instance.spawn_enemy("pirate", Vec2::new(8.0, 5.0), &content);
        instance.spawn_enemy("pirate", Vec2::new(35.0, 35.0), &content);

        let events = run_ticks(&mut instance, &content, &mut rng, 0, 1);
        let snapshot = events.iter().find_map(|e| match e {
            InstanceEvent::ToPlayer {
                msg: ServerMessage::Snapshot { enemies, .. },
                ..
            } => Some(enemies),
            _ => None,
        });
        let enemies = snapshot.expect("snapshot on tick 0");
        assert_eq!(enemies.len(), 1);
        assert_eq!(enemies[0].def_id, "pirate");
    }

    #[test]
    fn test_spawn_scheduler_honors_region_cap() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(5);
        let mut map = TileMap::filled(30, 30, Tile::Floor);
        map.regions = vec![crate::map::SpawnRegion {
            area: crate::map::Rect::new(0, 0, 30, 30),
            weights: vec![("pirate".to_string(), 1.0)],
            max_alive: 3,
            rate: 100.0,
        }];
        let mut instance = Instance::new("spawny".to_string(), InstanceKind::Realm, map);
        run_ticks(&mut instance, &content, &mut rng, 0, 100);
        assert_eq!(instance.enemies.len(), 3);
    }

    #[test]
    fn test_dungeon_scheduler_inert_after_initial_spawn() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(6);
        let def = content.dungeon("cube_dungeon").unwrap().clone();
        let layout = crate::dungeon::generate(&def, &mut rng);
        let mut instance = Instance::new(
            "dungeon-test".to_string(),
            InstanceKind::Dungeon,
            layout.map,
        );
        instance.dungeon = Some(DungeonState {
            boss_room_center: layout.boss_room_center,
            source_instance: "realm-main".to_string(),
            boss_killed: false,
            initial_spawn_done: false,
            fixed_spawn: None,
        });
        instance.initial_dungeon_spawn(&content, &mut rng);
        let seeded = instance.enemies.len();
        assert!(seeded > 0);
        // The scheduler must not add anything afterwards.
        run_ticks(&mut instance, &content, &mut rng, 0, 200);
        assert!(instance.enemies.len() <= seeded);
    }

    #[test]
    fn test_dungeon_fixed_spawn_is_reused() {
        let content = content();
        let mut rng = StdRng::seed_from_u64(7);
        let def = content.dungeon("cube_dungeon").unwrap().clone();
        let layout = crate::dungeon::generate(&def, &mut rng);
        let mut instance = Instance::new(
            "dungeon-test".to_string(),
            InstanceKind::Dungeon,
            layout.map,
        );
        instance.dungeon = Some(DungeonState {
            boss_room_center: layout.boss_room_center,
            source_instance: "realm-main".to_string(),
            boss_killed: false,
            initial_spawn_done: true,
            fixed_spawn: None,
        });
        let first = instance.add_player(make_player(&content, "first"), &mut rng);
        let second = instance.add_player(make_player(&content, "second"), &mut rng);
        assert_eq!(first, second);
    }

    #[test]
    fn test_portal_interaction_range() {
        let content = content();
        let mut instance = hostile_instance();
        let mut player = make_player(&content, "traveler");
        player.pos = Vec2::new(10.0, 10.0);
        let player_id = player.id;
        instance.players.insert(player_id, player);
        let portal_id = instance.add_portal(Portal::new(
            Vec2::new(11.0, 10.0),
            "nexus-main".to_string(),
            InstanceKind::Nexus,
            "Nexus".to_string(),
            None,
        ));
        assert!(instance.try_enter_portal(player_id, portal_id).is_some());
        instance.players.get_mut(&player_id).unwrap().pos = Vec2::new(13.0, 10.0);
        assert!(instance.try_enter_portal(player_id, portal_id).is_none());
    }

    #[test]
    fn test_teleport_ability_lands_on_walkable_tile() {
        let content = content();
        let mut map = TileMap::filled(40, 40, Tile::Floor);
        // A wall across the aim line.
        for y in 0..40 {
            map.set_tile(16, y, Tile::Wall);
        }
        let mut instance = Instance::new("tp".to_string(), InstanceKind::Realm, map);
        let mut player = make_player(&content, "blinker");
        player.pos = Vec2::new(10.0, 10.0);
        player.equipment[1] = Some("blink_scroll".to_string());
        player.last_input.aim = 0.0;
        let player_id = player.id;
        instance.players.insert(player_id, player);

        instance.use_ability(player_id, 100.0, &content);
        let player = &instance.players[&player_id];
        assert!(player.pos.x > 10.0, "teleport moved the player");
        assert!(player.pos.x < 16.0 - player.radius, "but not through walls");
        assert!(instance.map.can_move_to(player.pos, player.radius));
    }

    #[test]
    fn test_damage_ability_hits_area() {
        let content = content();
        let mut instance = hostile_instance();
        let mut player = make_player(&content, "nova");
        player.pos = Vec2::new(10.0, 10.0);
        let player_id = player.id;
        instance.players.insert(player_id, player);
        let near = instance
            .spawn_enemy("pirate", Vec2::new(12.0, 10.0), &content)
            .unwrap();
        let far = instance
            .spawn_enemy("pirate", Vec2::new(20.0, 10.0), &content)
            .unwrap();

        instance.use_ability(player_id, 100.0, &content);
        assert!(instance.enemies[&near].hp < 100);
        assert_eq!(instance.enemies[&far].hp, 100);
        assert!(instance.events.iter().any(|e| matches!(
            e,
            InstanceEvent::Broadcast {
                msg: ServerMessage::AbilityEffect { .. }
            }
        )));
    }
}
