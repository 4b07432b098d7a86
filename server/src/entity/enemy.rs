//! The enemy entity: target acquisition, movement behaviors, the boss phase
//! machine, attack scheduling and damage attribution.

use std::collections::HashMap;
use std::f32::consts::PI;

use rand::Rng;

use realm_shared::Vec2;

use crate::content::{AttackDef, ContentTables, EnemyBehavior, EnemyDef};
use crate::entity::player::{Player, ProjectileSpawn};
use crate::entity::{new_entity_id, EntityId, Side};
use crate::map::TileMap;

/// Players further away than this are never targeted.
const TARGET_RANGE: f32 = 15.0;

/// How far a wander hop may land from the current position, per axis.
const WANDER_SPREAD: f32 = 3.0;

/// Seconds between wander target re-rolls.
const WANDER_INTERVAL: f32 = 2.0;

#[derive(Debug)]
pub struct Enemy {
    pub id: EntityId,
    pub def_id: String,
    pub pos: Vec2,
    pub radius: f32,
    pub hp: i32,
    pub max_hp: i32,
    /// Weak reference by id; the target may die or leave at any time.
    pub target: Option<EntityId>,
    /// Last fire time per attack index.
    last_fired: Vec<f64>,
    wander_target: Vec2,
    wander_timer: f32,
    orbit_angle: f32,
    pub phase_index: usize,
    phase_timer: f32,
    pub resting: bool,
    /// Attacker id -> cumulative damage, for loot attribution.
    pub damage_by_player: HashMap<EntityId, i64>,
    pub removed: bool,
}

impl Enemy {
    pub fn spawn(def: &EnemyDef, pos: Vec2) -> Enemy {
        Enemy {
            id: new_entity_id(),
            def_id: def.id.clone(),
            pos,
            radius: def.radius,
            hp: def.max_hp,
            max_hp: def.max_hp,
            target: None,
            last_fired: vec![f64::NEG_INFINITY; def.attacks.len()],
            wander_target: pos,
            wander_timer: 0.0,
            orbit_angle: 0.0,
            phase_index: 0,
            phase_timer: 0.0,
            resting: false,
            damage_by_player: HashMap::new(),
            removed: false,
        }
    }

    pub fn hp_percent(&self) -> f32 {
        100.0 * self.hp as f32 / self.max_hp as f32
    }

    /// The phase active at the given hp percentage: phases are stored in
    /// descending threshold order and the last one still at or above the
    /// current percentage wins.
    pub fn phase_for(def: &EnemyDef, hp_percent: f32) -> usize {
        let mut current = 0;
        for (idx, phase) in def.phases.iter().enumerate() {
            if phase.hp_percent >= hp_percent {
                current = idx;
            }
        }
        current
    }

    /// Records a hit for loot attribution.
    pub fn attribute_damage(&mut self, attacker: EntityId, amount: i64) {
        if amount > 0 {
            *self.damage_by_player.entry(attacker).or_insert(0) += amount;
        }
    }

    /// Attackers whose attributed damage reaches `threshold_fraction` of
    /// max hp, eligible for soulbound drops.
    pub fn qualifying_players(&self, threshold_fraction: f64) -> Vec<EntityId> {
        let needed = (self.max_hp as f64 * threshold_fraction).ceil() as i64;
        self.damage_by_player
            .iter()
            .filter(|(_, &dealt)| dealt >= needed)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Per-tick update: acquire target, advance phase state, move, attack.
    /// Returns projectiles to spawn.
    pub fn update(
        &mut self,
        dt: f32,
        now: f64,
        map: &TileMap,
        players: &HashMap<EntityId, Player>,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) -> Vec<ProjectileSpawn> {
        let def = match content.enemy(&self.def_id) {
            Some(def) => def,
            None => return Vec::new(),
        };

        self.acquire_target(players);
        self.update_phase(def, dt);
        self.step(def, dt, map, players, rng);
        self.fire(def, now, players, content, rng)
    }

    fn acquire_target(&mut self, players: &HashMap<EntityId, Player>) {
        self.target = players
            .values()
            .map(|p| (p.id, self.pos.distance(p.pos)))
            .filter(|(_, d)| *d <= TARGET_RANGE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id);
    }

    fn update_phase(&mut self, def: &EnemyDef, dt: f32) {
        if def.phases.is_empty() {
            return;
        }
        let next = Self::phase_for(def, self.hp_percent());
        if next != self.phase_index {
            self.phase_index = next;
            self.phase_timer = 0.0;
            self.resting = false;
        }
        let phase = &def.phases[self.phase_index];
        self.phase_timer += dt;
        let limit = if self.resting {
            phase.rest_duration
        } else {
            phase.attack_duration
        };
        if self.phase_timer >= limit {
            self.phase_timer -= limit;
            self.resting = !self.resting;
        }
    }

    fn step(
        &mut self,
        def: &EnemyDef,
        dt: f32,
        map: &TileMap,
        players: &HashMap<EntityId, Player>,
        rng: &mut impl Rng,
    ) {
        let target_pos = self.target.and_then(|id| players.get(&id)).map(|p| p.pos);
        match def.behavior {
            EnemyBehavior::Stationary => {}
            EnemyBehavior::Wander => self.wander(def, dt, map, rng),
            EnemyBehavior::Chase => match target_pos {
                Some(pos) if self.pos.distance(pos) <= def.range => {
                    let hold_back = def
                        .attacks
                        .first()
                        .map(|a| (a.range * 0.5).max(2.0))
                        .unwrap_or(2.0);
                    if self.pos.distance(pos) > hold_back {
                        self.move_toward(pos, def.speed * dt, map);
                    }
                }
                _ => self.wander(def, dt, map, rng),
            },
            EnemyBehavior::Orbit => match target_pos {
                Some(pos) => {
                    if self.pos.distance(pos) > def.range + 1.0 {
                        self.move_toward(pos, def.speed * dt, map);
                    } else {
                        self.orbit_angle += def.orbit_speed * dt;
                        let anchor = pos
                            + Vec2::new(
                                def.range * self.orbit_angle.cos(),
                                def.range * self.orbit_angle.sin(),
                            );
                        self.move_toward(anchor, def.speed * dt, map);
                    }
                }
                None => self.wander(def, dt, map, rng),
            },
        }
    }

    /// Axis-sign stepping toward a periodically re-rolled point near home.
    /// The jitter is intentional.
    fn wander(&mut self, def: &EnemyDef, dt: f32, map: &TileMap, rng: &mut impl Rng) {
        self.wander_timer -= dt;
        if self.wander_timer <= 0.0 || self.pos.distance(self.wander_target) < 0.2 {
            self.wander_timer = WANDER_INTERVAL;
            self.wander_target = Vec2::new(
                self.pos.x + rng.gen_range(-WANDER_SPREAD..WANDER_SPREAD),
                self.pos.y + rng.gen_range(-WANDER_SPREAD..WANDER_SPREAD),
            );
        }
        let step = def.speed * dt;
        let dx = (self.wander_target.x - self.pos.x).signum() * step;
        let dy = (self.wander_target.y - self.pos.y).signum() * step;
        let mut moved = false;
        let x_next = Vec2::new(self.pos.x + dx, self.pos.y);
        if dx.abs() > 0.0 && map.can_move_to(x_next, self.radius) {
            self.pos = x_next;
            moved = true;
        }
        let y_next = Vec2::new(self.pos.x, self.pos.y + dy);
        if dy.abs() > 0.0 && map.can_move_to(y_next, self.radius) {
            self.pos = y_next;
            moved = true;
        }
        if !moved {
            // Stuck against geometry: re-roll on the next tick.
            self.wander_timer = 0.0;
        }
    }

    fn move_toward(&mut self, target: Vec2, step: f32, map: &TileMap) {
        let next = self.pos + (target - self.pos).normalize().scale(step);
        if map.can_move_to(next, self.radius) {
            self.pos = next;
        }
    }

    fn fire(
        &mut self,
        def: &EnemyDef,
        now: f64,
        players: &HashMap<EntityId, Player>,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) -> Vec<ProjectileSpawn> {
        let target = match self.target.and_then(|id| players.get(&id)) {
            Some(target) => target,
            None => return Vec::new(),
        };
        if !def.phases.is_empty() && self.resting {
            return Vec::new();
        }

        let allowed: Vec<usize> = if def.phases.is_empty() {
            (0..def.attacks.len()).collect()
        } else {
            def.phases[self.phase_index].attack_indices.clone()
        };

        let mut spawns = Vec::new();
        for idx in allowed {
            let attack = match def.attacks.get(idx) {
                Some(attack) => attack,
                None => continue,
            };
            if now - self.last_fired[idx] < 1.0 / attack.rate_of_fire as f64 {
                continue;
            }
            let distance = self.pos.distance(target.pos);
            if distance > attack.range {
                continue;
            }
            self.last_fired[idx] = now;
            spawns.extend(self.fan(attack, target, distance, content, rng));
        }
        spawns
    }

    fn fan(
        &self,
        attack: &AttackDef,
        target: &Player,
        distance: f32,
        content: &ContentTables,
        rng: &mut impl Rng,
    ) -> Vec<ProjectileSpawn> {
        let speed = content
            .projectile(&attack.projectile)
            .map(|p| p.speed)
            .unwrap_or(10.0);
        let aim_point = if attack.predictive {
            // Lead the target: extrapolate along its observed input at its
            // effective speed for the projectile's time of flight.
            let flight = distance / speed;
            let dir = target.last_input.move_dir.normalize();
            target.pos + dir.scale(target.effective_speed(content) * flight)
        } else {
            target.pos
        };
        let aim = (aim_point - self.pos).angle();
        let gap = attack.arc_gap_deg * PI / 180.0;
        let lifetime = attack.range / speed;
        realm_shared::fan_angles(aim, attack.num_projectiles, gap)
            .into_iter()
            .map(|angle| ProjectileSpawn {
                owner: self.id,
                side: Side::Enemy,
                projectile: attack.projectile.clone(),
                pos: self.pos,
                angle,
                damage: rng.gen_range(attack.min_damage..=attack.max_damage),
                pierce: false,
                lifetime,
            })
            .collect()
    }
}
