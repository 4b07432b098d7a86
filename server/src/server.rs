//! Server orchestration: the game loop, standing instances, cross-instance
//! transfers, dungeon and vault lifecycle, admin commands and autosave.
//!
//! One task owns a [`GameServer`] and everything inside it. Session tasks
//! reach it only through [`GameCommand`]s; replies travel back over each
//! connection's writer handle. Commands are drained between ticks, so no
//! suspension ever interleaves with an instance's update.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use realm_shared::protocol::{self, CharacterSummary, ServerMessage};
use realm_shared::{
    InstanceKind, Vec2, AOI_RADIUS, DUNGEON_PORTAL_EXPIRY_SECS, EQUIP_SLOTS, INVENTORY_SIZE,
    MAX_LEVEL, TICK_RATE, VAULT_SIZE,
};

use crate::admin::{AdminCommand, AdminList};
use crate::content::{exp_for_level, ContentTables};
use crate::dungeon;
use crate::entity::player::Player;
use crate::entity::portal::Portal;
use crate::entity::{EntityId, VaultChest};
use crate::instance::{DungeonState, Instance, InstanceEvent};
use crate::map;
use crate::persistence::{Character, Store};
use crate::session::{ConnId, GameCommand, SessionHandle};
use crate::tick::{RunFlag, Ticker};

pub const NEXUS_ID: &str = "nexus-main";
pub const REALM_ID: &str = "realm-main";

/// Portal target sentinel resolved per-account at entry time.
pub const VAULT_SENTINEL: &str = "vault";

/// Autosave cadence in ticks (30 s at 20 Hz).
const AUTOSAVE_TICKS: u64 = 30 * TICK_RATE as u64;

/// Status log cadence in ticks.
const STATUS_TICKS: u64 = 600;

struct SessionRecord {
    reply: SessionHandle,
    account_id: Uuid,
    username: String,
    character_id: Uuid,
    player: Option<EntityId>,
    instance: Option<String>,
    vault_open: bool,
}

pub struct GameServer {
    content: Arc<ContentTables>,
    store: Arc<Mutex<Store>>,
    admin: AdminList,
    instances: HashMap<String, Instance>,
    sessions: HashMap<ConnId, SessionRecord>,
    /// player entity id -> connection, written on enter/leave only.
    routes: HashMap<EntityId, ConnId>,
    /// Connections whose writer died; swept at the end of the tick.
    dead_conns: Vec<ConnId>,
    now: f64,
    tick: u64,
}

impl GameServer {
    /// Builds the server with its two standing worlds wired together.
    pub fn new(content: Arc<ContentTables>, store: Arc<Mutex<Store>>, admin: AdminList) -> GameServer {
        let mut server = GameServer {
            content,
            store,
            admin,
            instances: HashMap::new(),
            sessions: HashMap::new(),
            routes: HashMap::new(),
            dead_conns: Vec::new(),
            now: 0.0,
            tick: 0,
        };

        let mut nexus = Instance::new(NEXUS_ID.to_string(), InstanceKind::Nexus, map::build_nexus());
        nexus.add_portal(Portal::new(
            Vec2::new(20.5, 16.5),
            REALM_ID.to_string(),
            InstanceKind::Realm,
            "Realm".to_string(),
            None,
        ));
        nexus.add_portal(Portal::new(
            Vec2::new(11.5, 16.5),
            VAULT_SENTINEL.to_string(),
            InstanceKind::Vault,
            "Vault".to_string(),
            None,
        ));
        server.instances.insert(nexus.id.clone(), nexus);

        let mut rng = rand::thread_rng();
        let mut realm = Instance::new(REALM_ID.to_string(), InstanceKind::Realm, map::build_realm(&mut rng));
        realm.add_portal(Portal::new(
            Vec2::new(40.5, 36.5),
            NEXUS_ID.to_string(),
            InstanceKind::Nexus,
            "Nexus".to_string(),
            None,
        ));
        server.instances.insert(realm.id.clone(), realm);

        info!("standing instances ready: {}, {}", NEXUS_ID, REALM_ID);
        server
    }

    /// Drives the server until the flag drops; saves everything on the way
    /// out.
    pub async fn run(mut self, mut commands: UnboundedReceiver<GameCommand>, flag: RunFlag) {
        let mut ticker = Ticker::new(TICK_RATE);
        info!("game loop running at {} Hz", TICK_RATE);
        while flag.is_running() {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                step = ticker.next() => {
                    let (tick, dt) = step;
                    self.tick_once(tick, dt);
                }
            }
        }
        info!("game loop stopping, final save");
        self.save_all_characters();
        if let Err(e) = self.store.lock().expect("store lock").flush() {
            error!("final flush failed: {}", e);
        }
    }

    /// One simulation step across every registered instance.
    pub fn tick_once(&mut self, tick: u64, dt: f32) {
        self.tick = tick;
        self.now += dt as f64;
        let now = self.now;
        let content = self.content.clone();

        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            let events = {
                let instance = match self.instances.get_mut(&id) {
                    Some(instance) => instance,
                    None => continue,
                };
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let mut rng = rand::thread_rng();
                    instance.update(dt, now, tick, &content, &mut rng)
                }));
                match result {
                    Ok(events) => events,
                    Err(_) => {
                        // Contain the blast radius; the next tick proceeds.
                        error!("instance {} panicked during update", id);
                        Vec::new()
                    }
                }
            };
            self.dispatch_events(&id, events);
        }

        if tick > 0 && tick % AUTOSAVE_TICKS == 0 {
            self.save_all_characters();
        }
        if tick > 0 && tick % STATUS_TICKS == 0 {
            let players: usize = self.instances.values().map(|i| i.players.len()).sum();
            info!(
                "tick {}: {} instances, {} players, {} sessions",
                tick,
                self.instances.len(),
                players,
                self.sessions.len()
            );
        }

        let dead: Vec<ConnId> = self.dead_conns.drain(..).collect();
        for conn in dead {
            self.detach(conn);
            self.sessions.remove(&conn);
        }
    }

    fn dispatch_events(&mut self, instance_id: &str, events: Vec<InstanceEvent>) {
        for event in events {
            match event {
                InstanceEvent::ToPlayer { player, msg } => self.send_to_player(player, &msg),
                InstanceEvent::Broadcast { msg } => {
                    let ids: Vec<EntityId> = self
                        .instances
                        .get(instance_id)
                        .map(|i| i.players.keys().copied().collect())
                        .unwrap_or_default();
                    for id in ids {
                        self.send_to_player(id, &msg);
                    }
                }
                InstanceEvent::BroadcastNear { pos, msg } => {
                    let ids: Vec<EntityId> = self
                        .instances
                        .get(instance_id)
                        .map(|i| {
                            i.players
                                .values()
                                .filter(|p| p.pos.distance(pos) <= AOI_RADIUS)
                                .map(|p| p.id)
                                .collect()
                        })
                        .unwrap_or_default();
                    for id in ids {
                        self.send_to_player(id, &msg);
                    }
                }
                InstanceEvent::PlayerDied { player, killed_by } => {
                    self.handle_player_death(player, &killed_by);
                }
                InstanceEvent::OpenDungeon { dungeon, at } => {
                    self.open_dungeon(instance_id, &dungeon, at);
                }
                InstanceEvent::BossKilled { at } => {
                    self.add_return_portal(instance_id, at);
                }
            }
        }
    }

    // === Outbound plumbing ===

    fn send_to_player(&mut self, player: EntityId, msg: &ServerMessage) {
        let conn = match self.routes.get(&player) {
            Some(&conn) => conn,
            None => return,
        };
        self.send_to_conn(conn, msg);
    }

    fn send_to_conn(&mut self, conn: ConnId, msg: &ServerMessage) {
        if let Some(record) = self.sessions.get(&conn) {
            let frame = Message::Binary(protocol::encode(msg));
            if record.reply.send(frame).is_err() && !self.dead_conns.contains(&conn) {
                self.dead_conns.push(conn);
            }
        }
    }

    fn send_character_list(&mut self, conn: ConnId) {
        let account_id = match self.sessions.get(&conn) {
            Some(record) => record.account_id,
            None => return,
        };
        let characters: Vec<CharacterSummary> = {
            let store = self.store.lock().expect("store lock");
            store
                .alive_characters(account_id)
                .into_iter()
                .map(|c| CharacterSummary {
                    id: c.id,
                    class_id: c.class_id.clone(),
                    level: c.level,
                })
                .collect()
        };
        self.send_to_conn(conn, &ServerMessage::CharacterList { characters });
    }

    fn send_instance_change(&mut self, conn: ConnId, instance_id: &str, spawn: Vec2, player: EntityId) {
        let payload = match self.instances.get(instance_id) {
            Some(instance) => ServerMessage::InstanceChange {
                instance: instance.id.clone(),
                kind: instance.kind,
                width: instance.map.width as u32,
                height: instance.map.height as u32,
                tiles: instance.map.tile_codes(),
                spawn_x: spawn.x,
                spawn_y: spawn.y,
                player,
            },
            None => return,
        };
        self.send_to_conn(conn, &payload);
    }

    // === Command handling ===

    fn handle_command(&mut self, cmd: GameCommand) {
        match cmd {
            GameCommand::Attach {
                conn,
                reply,
                account_id,
                username,
                character_id,
            } => self.attach(conn, reply, account_id, username, character_id),
            GameCommand::Detach { conn } => {
                self.detach(conn);
                self.sessions.remove(&conn);
            }
            GameCommand::Input {
                conn,
                move_dir,
                aim,
                shooting,
            } => {
                if let Some((instance, player)) = self.resident_mut(conn) {
                    if let Some(p) = instance.players.get_mut(&player) {
                        p.last_input.move_dir = move_dir;
                        p.last_input.aim = aim;
                        p.last_input.shooting = shooting;
                    }
                }
            }
            GameCommand::Shoot { conn, aim } => {
                let now = self.now;
                let content = self.content.clone();
                if let Some((instance, player)) = self.resident_mut(conn) {
                    let mut rng = rand::thread_rng();
                    instance.player_shoot(player, aim, now, &content, &mut rng);
                }
            }
            GameCommand::UseAbility { conn } => {
                let now = self.now;
                let content = self.content.clone();
                if let Some((instance, player)) = self.resident_mut(conn) {
                    instance.use_ability(player, now, &content);
                }
            }
            GameCommand::PickupLoot { conn, loot } => {
                let content = self.content.clone();
                if let Some((instance, player)) = self.resident_mut(conn) {
                    instance.try_pickup_loot(player, loot, &content);
                }
            }
            GameCommand::EnterPortal { conn, portal } => self.enter_portal(conn, portal),
            GameCommand::ReturnToNexus { conn } => {
                self.transfer(conn, NEXUS_ID.to_string());
            }
            GameCommand::Chat { conn, message } => self.chat(conn, message),
            GameCommand::SwapItems { conn, from, to } => {
                let content = self.content.clone();
                if let Some((instance, player)) = self.resident_mut(conn) {
                    if let Some(p) = instance.players.get_mut(&player) {
                        p.swap_items(from, to, &content);
                    }
                }
            }
            GameCommand::DropItem { conn, slot } => self.drop_item(conn, slot),
            GameCommand::InteractVaultChest { conn } => self.interact_vault_chest(conn),
            GameCommand::VaultTransfer {
                conn,
                from_vault,
                from_slot,
                to_slot,
            } => self.vault_transfer(conn, from_vault, from_slot, to_slot),
            GameCommand::CloseVault { conn } => self.close_vault(conn),
        }
    }

    /// The instance and player entity id a connection is resident in.
    fn resident_mut(&mut self, conn: ConnId) -> Option<(&mut Instance, EntityId)> {
        let record = self.sessions.get(&conn)?;
        let player = record.player?;
        let instance_id = record.instance.clone()?;
        let instance = self.instances.get_mut(&instance_id)?;
        Some((instance, player))
    }

    fn attach(
        &mut self,
        conn: ConnId,
        reply: SessionHandle,
        account_id: Uuid,
        username: String,
        character_id: Uuid,
    ) {
        // A re-select replaces the current embodiment.
        if self.sessions.contains_key(&conn) {
            self.detach(conn);
            self.sessions.remove(&conn);
        }

        let character = match self.store.lock().expect("store lock").get_character(character_id) {
            Some(c) if c.account_id == account_id && c.alive => c.clone(),
            _ => {
                warn!("attach for conn {} rejected: bad character", conn);
                return;
            }
        };
        let player = self.player_from_character(&character);
        let player_id = player.id;

        self.sessions.insert(
            conn,
            SessionRecord {
                reply,
                account_id,
                username,
                character_id,
                player: Some(player_id),
                instance: Some(NEXUS_ID.to_string()),
                vault_open: false,
            },
        );
        self.routes.insert(player_id, conn);

        let spawn = {
            let nexus = self.instances.get_mut(NEXUS_ID).expect("nexus exists");
            let mut rng = rand::thread_rng();
            nexus.add_player(player, &mut rng)
        };
        info!("conn {} embodied character {} in nexus", conn, character_id);
        self.send_instance_change(conn, NEXUS_ID, spawn, player_id);
    }

    /// Pulls the player out of the world and saves it. The session record
    /// survives (the account is still logged in) unless the caller removes
    /// it.
    fn detach(&mut self, conn: ConnId) {
        let (player_id, instance_id) = match self.sessions.get_mut(&conn) {
            Some(record) => {
                record.vault_open = false;
                match (record.player.take(), record.instance.take()) {
                    (Some(p), Some(i)) => (p, i),
                    _ => return,
                }
            }
            None => return,
        };
        self.routes.remove(&player_id);
        let player = self
            .instances
            .get_mut(&instance_id)
            .and_then(|instance| instance.remove_player(player_id));
        if let Some(player) = player {
            self.save_player(conn, &player);
        }
        self.reap_if_empty(&instance_id);
    }

    fn handle_player_death(&mut self, player: EntityId, killed_by: &str) {
        let conn = match self.routes.remove(&player) {
            Some(conn) => conn,
            None => return,
        };
        let character_id = match self.sessions.get_mut(&conn) {
            Some(record) => {
                record.player = None;
                record.instance = None;
                record.vault_open = false;
                record.character_id
            }
            None => return,
        };
        // Permadeath is the success path of hp reaching zero.
        if let Err(e) = self.store.lock().expect("store lock").kill_character(character_id) {
            error!("kill_character {} failed: {}", character_id, e);
        }
        info!("character {} died to {}", character_id, killed_by);
        self.send_to_conn(
            conn,
            &ServerMessage::Death {
                killed_by: killed_by.to_string(),
            },
        );
        self.send_character_list(conn);
    }

    // === Transfers, dungeons and vaults ===

    fn enter_portal(&mut self, conn: ConnId, portal: EntityId) {
        let (account_id, player_id, instance_id) = match self.sessions.get(&conn) {
            Some(record) => match (record.player, record.instance.clone()) {
                (Some(p), Some(i)) => (record.account_id, p, i),
                _ => return,
            },
            None => return,
        };
        let target = match self
            .instances
            .get(&instance_id)
            .and_then(|instance| instance.try_enter_portal(player_id, portal))
        {
            Some(portal) => portal.target.clone(),
            None => return,
        };

        let target_id = if target == VAULT_SENTINEL {
            self.get_or_create_vault(account_id)
        } else {
            target
        };
        // Vault isolation: only the owning account may ever enter.
        if let Some(instance) = self.instances.get(&target_id) {
            if instance.kind == InstanceKind::Vault
                && target_id != format!("vault-{}", account_id)
            {
                warn!("conn {} denied entry to {}", conn, target_id);
                return;
            }
        } else {
            // Target gone (expired dungeon): silently no-op.
            return;
        }
        self.transfer(conn, target_id);
    }

    fn transfer(&mut self, conn: ConnId, target_id: String) {
        let (player_id, source_id) = match self.sessions.get(&conn) {
            Some(record) => match (record.player, record.instance.clone()) {
                (Some(p), Some(i)) => (p, i),
                _ => return,
            },
            None => return,
        };
        if source_id == target_id || !self.instances.contains_key(&target_id) {
            return;
        }
        let player = match self
            .instances
            .get_mut(&source_id)
            .and_then(|instance| instance.remove_player(player_id))
        {
            Some(player) => player,
            None => return,
        };
        let spawn = {
            let target = self.instances.get_mut(&target_id).expect("target checked");
            let mut rng = rand::thread_rng();
            target.add_player(player, &mut rng)
        };
        if let Some(record) = self.sessions.get_mut(&conn) {
            record.instance = Some(target_id.clone());
            record.vault_open = false;
        }
        self.reap_if_empty(&source_id);
        self.send_instance_change(conn, &target_id, spawn, player_id);
    }

    fn get_or_create_vault(&mut self, account_id: Uuid) -> String {
        let vault_id = format!("vault-{}", account_id);
        if !self.instances.contains_key(&vault_id) {
            let (map, chest_pos) = map::build_vault();
            let mut vault = Instance::new(vault_id.clone(), InstanceKind::Vault, map);
            vault.add_chest(VaultChest::new(chest_pos));
            vault.add_portal(Portal::new(
                Vec2::new(8.0, 11.5),
                NEXUS_ID.to_string(),
                InstanceKind::Nexus,
                "Nexus".to_string(),
                None,
            ));
            self.instances.insert(vault_id.clone(), vault);
            info!("created vault instance {}", vault_id);
        }
        vault_id
    }

    fn open_dungeon(&mut self, source_id: &str, dungeon_def: &str, at: Vec2) {
        let def = match self.content.dungeon(dungeon_def) {
            Some(def) => def.clone(),
            None => {
                warn!("unknown dungeon definition {}", dungeon_def);
                return;
            }
        };
        let mut rng = rand::thread_rng();
        let layout = dungeon::generate(&def, &mut rng);
        let dungeon_id = format!("dungeon-{}", Uuid::new_v4());
        let mut instance = Instance::new(dungeon_id.clone(), InstanceKind::Dungeon, layout.map);
        instance.dungeon = Some(DungeonState {
            boss_room_center: layout.boss_room_center,
            source_instance: source_id.to_string(),
            boss_killed: false,
            initial_spawn_done: false,
            fixed_spawn: None,
        });
        let content = self.content.clone();
        instance.initial_dungeon_spawn(&content, &mut rng);
        self.instances.insert(dungeon_id.clone(), instance);

        if let Some(source) = self.instances.get_mut(source_id) {
            source.add_portal(Portal::new(
                at,
                dungeon_id.clone(),
                InstanceKind::Dungeon,
                def.name.clone(),
                Some(self.now + DUNGEON_PORTAL_EXPIRY_SECS),
            ));
        }
        info!("dungeon {} opened from {}", dungeon_id, source_id);
    }

    fn add_return_portal(&mut self, dungeon_id: &str, at: Vec2) {
        let (source_id, source_kind) = {
            let source_id = match self
                .instances
                .get(dungeon_id)
                .and_then(|i| i.dungeon.as_ref())
            {
                Some(state) => state.source_instance.clone(),
                None => return,
            };
            let kind = self
                .instances
                .get(&source_id)
                .map(|i| i.kind)
                .unwrap_or(InstanceKind::Realm);
            (source_id, kind)
        };
        if let Some(instance) = self.instances.get_mut(dungeon_id) {
            instance.add_portal(Portal::new(
                at,
                source_id,
                source_kind,
                "Way Back".to_string(),
                None,
            ));
            info!("return portal added in {}", dungeon_id);
        }
    }

    /// Dungeons and vaults exist only while occupied.
    fn reap_if_empty(&mut self, instance_id: &str) {
        let reap = match self.instances.get(instance_id) {
            Some(instance) => {
                matches!(instance.kind, InstanceKind::Dungeon | InstanceKind::Vault)
                    && instance.is_empty_of_players()
            }
            None => false,
        };
        if reap {
            self.instances.remove(instance_id);
            info!("reaped empty instance {}", instance_id);
        }
    }

    // === Items and vault traffic ===

    fn drop_item(&mut self, conn: ConnId, slot: u8) {
        let now = self.now;
        let content = self.content.clone();
        let total = (EQUIP_SLOTS + INVENTORY_SIZE) as u8;
        if slot >= total {
            return;
        }
        if let Some((instance, player_id)) = self.resident_mut(conn) {
            let item = match instance.players.get_mut(&player_id) {
                Some(player) => {
                    let taken = if (slot as usize) < EQUIP_SLOTS {
                        player.equipment[slot as usize].take()
                    } else {
                        player.inventory[slot as usize - EQUIP_SLOTS].take()
                    };
                    player.clamp_vitals(&content);
                    taken
                }
                None => None,
            };
            if let Some(item) = item {
                let soulbound = content
                    .item(&item)
                    .map(|def| def.soulbound)
                    .unwrap_or(false);
                instance.drop_item(player_id, item, now, soulbound);
            }
        }
    }

    fn interact_vault_chest(&mut self, conn: ConnId) {
        let account_id = match self.sessions.get(&conn) {
            Some(record) => record.account_id,
            None => return,
        };
        let in_range = match self.resident_mut(conn) {
            Some((instance, player_id)) => {
                instance.kind == InstanceKind::Vault && instance.chest_in_range(player_id).is_some()
            }
            None => false,
        };
        if !in_range {
            return;
        }
        let items = self.store.lock().expect("store lock").get_vault_items(account_id);
        if let Some(record) = self.sessions.get_mut(&conn) {
            record.vault_open = true;
        }
        self.send_to_conn(conn, &ServerMessage::VaultOpen { items });
    }

    fn vault_transfer(&mut self, conn: ConnId, from_vault: bool, from_slot: u8, to_slot: u8) {
        let (account_id, player_id, instance_id) = match self.sessions.get(&conn) {
            Some(record) => match (record.player, record.instance.clone()) {
                (Some(p), Some(i)) => (record.account_id, p, i),
                _ => return,
            },
            None => return,
        };
        // Only inside the session's own vault instance.
        let own_vault = format!("vault-{}", account_id);
        let is_own_vault = instance_id == own_vault
            && self
                .instances
                .get(&instance_id)
                .map(|i| i.kind == InstanceKind::Vault)
                .unwrap_or(false);
        if !is_own_vault {
            warn!("conn {} vault transfer outside own vault dropped", conn);
            return;
        }
        let (vault_slot, inv_slot) = if from_vault {
            (from_slot as usize, to_slot as usize)
        } else {
            (to_slot as usize, from_slot as usize)
        };
        if vault_slot >= VAULT_SIZE || inv_slot >= INVENTORY_SIZE {
            return;
        }

        let mut items = self.store.lock().expect("store lock").get_vault_items(account_id);
        let swapped = {
            let instance = match self.instances.get_mut(&instance_id) {
                Some(instance) => instance,
                None => return,
            };
            match instance.players.get_mut(&player_id) {
                Some(player) => {
                    std::mem::swap(&mut items[vault_slot], &mut player.inventory[inv_slot]);
                    true
                }
                None => false,
            }
        };
        if !swapped {
            return;
        }
        // Persist immediately; a crash never loses a transferred item.
        if let Err(e) = self
            .store
            .lock()
            .expect("store lock")
            .save_vault_items(account_id, items.clone())
        {
            error!("vault save for {} failed: {}", account_id, e);
        }
        self.send_to_conn(conn, &ServerMessage::VaultUpdate { items });
    }

    fn close_vault(&mut self, conn: ConnId) {
        if let Some(record) = self.sessions.get_mut(&conn) {
            record.vault_open = false;
        }
    }

    // === Chat and admin ===

    fn chat(&mut self, conn: ConnId, message: String) {
        let (username, player_id, instance_id) = match self.sessions.get(&conn) {
            Some(record) => match (record.player, record.instance.clone()) {
                (Some(p), Some(i)) => (record.username.clone(), p, i),
                _ => return,
            },
            None => return,
        };

        if message.starts_with('/') && self.admin.is_admin(&username) {
            if let Some(command) = AdminCommand::parse(&message) {
                self.run_admin_command(conn, player_id, &instance_id, command);
                return;
            }
            // Unknown admin command falls through and broadcasts.
        }

        let msg = ServerMessage::Chat {
            from: username,
            message,
        };
        let ids: Vec<EntityId> = self
            .instances
            .get(&instance_id)
            .map(|i| i.players.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.send_to_player(id, &msg);
        }
    }

    fn server_whisper(&mut self, conn: ConnId, text: String) {
        self.send_to_conn(
            conn,
            &ServerMessage::Chat {
                from: "server".to_string(),
                message: text,
            },
        );
    }

    fn run_admin_command(
        &mut self,
        conn: ConnId,
        player_id: EntityId,
        instance_id: &str,
        command: AdminCommand,
    ) {
        let content = self.content.clone();
        match command {
            AdminCommand::Give { item } => {
                if content.item(&item).is_none() {
                    self.server_whisper(conn, format!("unknown item: {}", item));
                    return;
                }
                let placed = self
                    .instances
                    .get_mut(instance_id)
                    .and_then(|i| i.players.get_mut(&player_id))
                    .and_then(|player| {
                        player.free_inventory_slot().map(|slot| {
                            player.inventory[slot] = Some(item.clone());
                        })
                    })
                    .is_some();
                if !placed {
                    self.server_whisper(conn, "inventory full".to_string());
                }
            }
            AdminCommand::Items { filter } => {
                let mut ids: Vec<&str> = content
                    .items
                    .keys()
                    .map(|s| s.as_str())
                    .filter(|id| filter.as_deref().map_or(true, |f| id.contains(f)))
                    .collect();
                ids.sort_unstable();
                self.server_whisper(conn, ids.join(", "));
            }
            AdminCommand::Heal => {
                if let Some(player) = self
                    .instances
                    .get_mut(instance_id)
                    .and_then(|i| i.players.get_mut(&player_id))
                {
                    player.hp = player.effective_max_hp(&content);
                    player.mp = player.effective_max_mp(&content);
                }
            }
            AdminCommand::Level { level } => {
                let target = level.clamp(1, MAX_LEVEL);
                let result = self
                    .instances
                    .get_mut(instance_id)
                    .and_then(|i| i.players.get_mut(&player_id))
                    .map(|player| {
                        while player.level < target {
                            player.gain_exp(exp_for_level(player.level + 1), &content);
                        }
                        (
                            player.level,
                            player.effective_max_hp(&content),
                            player.effective_max_mp(&content),
                        )
                    });
                if let Some((level, max_hp, max_mp)) = result {
                    self.send_to_conn(
                        conn,
                        &ServerMessage::LevelUp {
                            level,
                            max_hp,
                            max_mp,
                        },
                    );
                }
            }
            AdminCommand::Spawn { enemy } => {
                if content.enemy(&enemy).is_none() {
                    self.server_whisper(conn, format!("unknown enemy: {}", enemy));
                    return;
                }
                if let Some(instance) = self.instances.get_mut(instance_id) {
                    if let Some(pos) = instance.players.get(&player_id).map(|p| p.pos) {
                        let spot = Vec2::new(pos.x + 2.0, pos.y);
                        let spot = if instance.map.can_move_to(spot, 0.5) {
                            spot
                        } else {
                            pos
                        };
                        instance.spawn_enemy(&enemy, spot, &content);
                    }
                }
            }
            AdminCommand::Teleport { x, y } => {
                if let Some(instance) = self.instances.get_mut(instance_id) {
                    let dest = Vec2::new(x, y);
                    if let Some(player) = instance.players.get_mut(&player_id) {
                        if instance.map.can_move_to(dest, player.radius) {
                            player.pos = dest;
                        }
                    }
                }
            }
            AdminCommand::Help => {
                self.server_whisper(conn, AdminCommand::HELP_TEXT.to_string());
            }
        }
    }

    // === Persistence plumbing ===

    fn player_from_character(&self, character: &Character) -> Player {
        Player::new(
            character.id,
            character.account_id,
            character.name.clone(),
            character.class_id.clone(),
            character.level,
            character.exp,
            character.hp.max(1),
            character.mp.max(0),
            character.stats,
            character.equipment.clone(),
            character.inventory.clone(),
            character.counters,
            &self.content,
        )
    }

    fn save_player(&self, conn: ConnId, player: &Player) {
        let record = match self.sessions.get(&conn) {
            Some(record) => record,
            None => return,
        };
        let character = Character {
            id: record.character_id,
            account_id: record.account_id,
            name: player.name.clone(),
            class_id: player.class_id.clone(),
            level: player.level,
            exp: player.exp,
            hp: player.hp,
            mp: player.mp,
            stats: player.stats,
            equipment: player.equipment.clone(),
            inventory: player.inventory.clone(),
            counters: player.counters,
            alive: true,
        };
        if let Err(e) = self.store.lock().expect("store lock").save_character(character) {
            error!("saving character {} failed: {}", record.character_id, e);
        }
    }

    /// Autosave pass over every resident character.
    fn save_all_characters(&self) {
        for (&conn, record) in &self.sessions {
            let (instance_id, player_id) = match (&record.instance, record.player) {
                (Some(instance), Some(player)) => (instance, player),
                _ => continue,
            };
            let player = self
                .instances
                .get(instance_id)
                .and_then(|instance| instance.players.get(&player_id));
            if let Some(player) = player {
                self.save_player(conn, player);
            }
        }
    }

    #[cfg(test)]
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: TempDir,
        server: GameServer,
        store: Arc<Mutex<Store>>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(
            Store::open(&dir.path().join("db.json")).unwrap(),
        ));
        let admin = AdminList::load(&dir.path().join("admins.txt"));
        let content = Arc::new(ContentTables::builtin());
        let server = GameServer::new(content, store.clone(), admin);
        Harness {
            _dir: dir,
            server,
            store,
        }
    }

    fn new_player(
        h: &mut Harness,
        conn: ConnId,
        name: &str,
    ) -> (Uuid, Uuid, mpsc::UnboundedReceiver<Message>) {
        let (account_id, character_id) = {
            let mut store = h.store.lock().unwrap();
            let account = store.create_account(name, "pw").unwrap();
            let content = ContentTables::builtin();
            let class = content.class("wizard").unwrap();
            let character = store
                .create_character(
                    account,
                    "wizard",
                    class.base_stats,
                    class.base_hp,
                    class.base_mp,
                    class.starting_equipment.clone(),
                )
                .unwrap();
            (account, character)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        h.server.handle_command(GameCommand::Attach {
            conn,
            reply: tx,
            account_id,
            username: name.to_string(),
            character_id,
        });
        (account_id, character_id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Binary(bytes) = msg {
                if let Ok(decoded) = protocol::decode_server(&bytes) {
                    out.push(decoded);
                }
            }
        }
        out
    }

    #[test]
    fn test_attach_places_player_in_nexus() {
        let mut h = harness();
        let (_, _, mut rx) = new_player(&mut h, 1, "alice");
        let msgs = drain(&mut rx);
        let change = msgs.iter().find_map(|m| match m {
            ServerMessage::InstanceChange { instance, kind, .. } => Some((instance.clone(), *kind)),
            _ => None,
        });
        let (instance, kind) = change.expect("instance change sent");
        assert_eq!(instance, NEXUS_ID);
        assert_eq!(kind, InstanceKind::Nexus);
    }

    #[test]
    fn test_vault_isolation_between_accounts() {
        let mut h = harness();
        let (account_a, _, mut rx_a) = new_player(&mut h, 1, "alice");
        let (account_b, _, mut rx_b) = new_player(&mut h, 2, "bob");

        let vault_a = h.server.get_or_create_vault(account_a);
        let vault_b = h.server.get_or_create_vault(account_b);
        assert_eq!(vault_a, format!("vault-{}", account_a));
        assert_ne!(vault_a, vault_b);

        h.server.transfer(1, vault_a.clone());
        h.server.transfer(2, vault_b.clone());
        assert_eq!(
            h.server.sessions.get(&1).unwrap().instance.as_deref(),
            Some(vault_a.as_str())
        );

        // Seed A's vault, then have B aim a transfer at it: silently dropped
        // because B is not inside their own vault target.
        let mut items = vec![None; VAULT_SIZE];
        items[0] = Some("cube_edge".to_string());
        h.store
            .lock()
            .unwrap()
            .save_vault_items(account_a, items.clone())
            .unwrap();
        // Move B into A's vault id path: vault_transfer checks the session's
        // own vault, so even while standing in vault_b a forged transfer
        // against A's slots only ever touches B's own store row.
        h.server.vault_transfer(2, true, 0, 0);
        assert_eq!(
            h.store.lock().unwrap().get_vault_items(account_a),
            items,
            "A's vault unchanged by B"
        );
        drain(&mut rx_a);
        drain(&mut rx_b);
    }

    #[test]
    fn test_vault_transfer_swaps_and_persists() {
        let mut h = harness();
        let (account, _, mut rx) = new_player(&mut h, 1, "carol");
        let vault_id = h.server.get_or_create_vault(account);
        h.server.transfer(1, vault_id.clone());
        {
            let (instance, player) = h.server.resident_mut(1).unwrap();
            let p = instance.players.get_mut(&player).unwrap();
            p.inventory[2] = Some("health_potion".to_string());
        }
        h.server.vault_transfer(1, false, 2, 0);
        let vault = h.store.lock().unwrap().get_vault_items(account);
        assert_eq!(vault[0].as_deref(), Some("health_potion"));
        let (instance, player) = h.server.resident_mut(1).unwrap();
        assert!(instance.players[&player].inventory[2].is_none());
        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::VaultUpdate { .. })));
    }

    #[test]
    fn test_vault_reaped_when_left() {
        let mut h = harness();
        let (account, _, _rx) = new_player(&mut h, 1, "dave");
        let vault_id = h.server.get_or_create_vault(account);
        h.server.transfer(1, vault_id.clone());
        assert!(h.server.instances.contains_key(&vault_id));
        h.server.transfer(1, NEXUS_ID.to_string());
        assert!(
            !h.server.instances.contains_key(&vault_id),
            "vault reaped when the last player leaves"
        );
    }

    #[test]
    fn test_dungeon_lifecycle() {
        let mut h = harness();
        let (_, _, _rx) = new_player(&mut h, 1, "erin");
        h.server.transfer(1, REALM_ID.to_string());
        h.server
            .open_dungeon(REALM_ID, "cube_dungeon", Vec2::new(40.0, 40.0));

        let dungeon_id = h
            .server
            .instance_ids()
            .into_iter()
            .find(|id| id.starts_with("dungeon-"))
            .expect("dungeon created");
        {
            let dungeon = &h.server.instances[&dungeon_id];
            assert!(!dungeon.enemies.is_empty(), "initial spawn done");
            assert!(dungeon.dungeon.as_ref().unwrap().initial_spawn_done);
        }
        // The realm gained an expiring portal to it.
        let realm = &h.server.instances[REALM_ID];
        let portal = realm
            .portals
            .values()
            .find(|p| p.target == dungeon_id)
            .expect("dungeon portal in realm");
        assert!(portal.expires_at.is_some());

        // Enter, then leave: the dungeon is reaped.
        h.server.transfer(1, dungeon_id.clone());
        assert_eq!(
            h.server.sessions[&1].instance.as_deref(),
            Some(dungeon_id.as_str())
        );
        h.server.transfer(1, NEXUS_ID.to_string());
        assert!(!h.server.instances.contains_key(&dungeon_id));
    }

    #[test]
    fn test_boss_kill_adds_return_portal() {
        let mut h = harness();
        let (_, _, _rx) = new_player(&mut h, 1, "frank");
        h.server.transfer(1, REALM_ID.to_string());
        h.server
            .open_dungeon(REALM_ID, "cube_dungeon", Vec2::new(40.0, 40.0));
        let dungeon_id = h
            .server
            .instance_ids()
            .into_iter()
            .find(|id| id.starts_with("dungeon-"))
            .unwrap();
        h.server.transfer(1, dungeon_id.clone());
        h.server
            .add_return_portal(&dungeon_id, Vec2::new(30.0, 30.0));
        let dungeon = &h.server.instances[&dungeon_id];
        let back = dungeon
            .portals
            .values()
            .find(|p| p.target == REALM_ID)
            .expect("return portal");
        assert!(back.expires_at.is_none(), "return portal is permanent");
    }

    #[test]
    fn test_player_death_is_permadeath() {
        let mut h = harness();
        let (account, character_id, mut rx) = new_player(&mut h, 1, "grace");
        let player_id = h.server.sessions[&1].player.unwrap();
        h.server.handle_player_death(player_id, "Pirate");

        assert!(h.server.sessions[&1].player.is_none());
        assert!(!h.server.routes.contains_key(&player_id));
        {
            let store = h.store.lock().unwrap();
            assert!(!store.get_character(character_id).unwrap().alive);
            assert!(store.alive_characters(account).is_empty());
        }
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Death { .. })));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::CharacterList { characters } if characters.is_empty())));
    }

    #[test]
    fn test_chat_broadcasts_within_instance_only() {
        let mut h = harness();
        let (_, _, mut rx_a) = new_player(&mut h, 1, "alice");
        let (_, _, mut rx_b) = new_player(&mut h, 2, "bob");
        let (_, _, mut rx_c) = new_player(&mut h, 3, "carol");
        h.server.transfer(3, REALM_ID.to_string());
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        h.server.chat(1, "hello nexus".to_string());
        let got_a = drain(&mut rx_a);
        let got_b = drain(&mut rx_b);
        let got_c = drain(&mut rx_c);
        assert!(got_a.iter().any(|m| matches!(m, ServerMessage::Chat { message, .. } if message == "hello nexus")));
        assert!(got_b.iter().any(|m| matches!(m, ServerMessage::Chat { .. })));
        assert!(got_c.is_empty(), "other instance hears nothing");
    }

    #[test]
    fn test_non_admin_slash_is_plain_chat() {
        let mut h = harness();
        let (_, _, mut rx) = new_player(&mut h, 1, "mallory");
        drain(&mut rx);
        h.server.chat(1, "/give cube_edge".to_string());
        let msgs = drain(&mut rx);
        // Delivered verbatim as chat; no item granted.
        assert!(msgs.iter().any(
            |m| matches!(m, ServerMessage::Chat { from, message } if from == "mallory" && message == "/give cube_edge")
        ));
        let (instance, player) = h.server.resident_mut(1).unwrap();
        assert!(instance.players[&player]
            .inventory
            .iter()
            .all(|slot| slot.is_none()));
    }

    #[test]
    fn test_admin_give_and_tp() {
        let mut h = harness();
        // Allowlist mallet via a real file.
        let dir = TempDir::new().unwrap();
        let allow = dir.path().join("admins.txt");
        std::fs::write(&allow, "root\n").unwrap();
        h.server.admin = AdminList::load(&allow);

        let (_, _, mut rx) = new_player(&mut h, 1, "root");
        drain(&mut rx);
        h.server.chat(1, "/give cube_edge".to_string());
        {
            let (instance, player) = h.server.resident_mut(1).unwrap();
            assert_eq!(
                instance.players[&player].inventory[0].as_deref(),
                Some("cube_edge")
            );
        }
        h.server.chat(1, "/tp 5 5".to_string());
        {
            let (instance, player) = h.server.resident_mut(1).unwrap();
            let pos = instance.players[&player].pos;
            assert_eq!((pos.x, pos.y), (5.0, 5.0));
        }
        // Admin chatter that is not a command still broadcasts.
        h.server.chat(1, "/dance".to_string());
        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::Chat { message, .. } if message == "/dance")));
    }

    #[test]
    fn test_detach_saves_character() {
        let mut h = harness();
        let (_, character_id, _rx) = new_player(&mut h, 1, "henry");
        {
            let (instance, player) = h.server.resident_mut(1).unwrap();
            let p = instance.players.get_mut(&player).unwrap();
            p.level = 5;
            p.inventory[3] = Some("magic_potion".to_string());
        }
        h.server.handle_command(GameCommand::Detach { conn: 1 });
        let store = h.store.lock().unwrap();
        let saved = store.get_character(character_id).unwrap();
        assert_eq!(saved.level, 5);
        assert_eq!(saved.inventory[3].as_deref(), Some("magic_potion"));
        assert!(saved.alive);
    }

    #[test]
    fn test_tick_advances_and_snapshots_flow() {
        let mut h = harness();
        let (_, _, mut rx) = new_player(&mut h, 1, "iris");
        drain(&mut rx);
        for tick in 0..4u64 {
            h.server.tick_once(tick, 0.05);
        }
        let msgs = drain(&mut rx);
        let snapshots = msgs
            .iter()
            .filter(|m| matches!(m, ServerMessage::Snapshot { .. }))
            .count();
        assert_eq!(snapshots, 2, "snapshots at half tick rate");
    }
}
