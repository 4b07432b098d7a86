//! Wire protocol: message taxonomy, snapshot views and the frame codec.
//!
//! Every frame is a self-describing envelope with a string `type` tag and a
//! `data` object, modeled as adjacently-tagged serde enums. Outbound frames
//! are always MessagePack in struct-map, human-readable mode, so field names
//! travel with the data and ids look identical on the binary and JSON paths;
//! inbound frames may be MessagePack binary or JSON text.
//!
//! Inbound decoding goes through a generic value first so the envelope shape
//! can be checked before any typed deserialization: frames whose top level
//! carries a prototype-pollution sentinel key are rejected outright, and
//! unknown `type` tags fail the typed decode and are dropped by the caller.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstanceKind, Vec2};

/// Keys that must never appear at the top level of an inbound frame.
const POLLUTION_SENTINELS: &[&str] = &["__proto__", "constructor"];

/// Messages a client may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Auth { user: String, pass: String },
    #[serde(rename_all = "camelCase")]
    AuthToken { token: String },
    #[serde(rename_all = "camelCase")]
    Logout { token: String },
    #[serde(rename_all = "camelCase")]
    Register { user: String, pass: String },
    #[serde(rename_all = "camelCase")]
    CreateCharacter { class_id: String },
    #[serde(rename_all = "camelCase")]
    SelectCharacter { character_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Input {
        move_direction: Vec2,
        aim_angle: f32,
        shooting: bool,
    },
    #[serde(rename_all = "camelCase")]
    Shoot { aim_angle: f32 },
    UseAbility,
    #[serde(rename_all = "camelCase")]
    PickupLoot { loot_id: Uuid },
    #[serde(rename_all = "camelCase")]
    EnterPortal { portal_id: Uuid },
    ReturnToNexus,
    #[serde(rename_all = "camelCase")]
    Chat { message: String },
    #[serde(rename_all = "camelCase")]
    SwapItems { from: u8, to: u8 },
    #[serde(rename_all = "camelCase")]
    DropItem { slot: u8 },
    InteractVaultChest,
    #[serde(rename_all = "camelCase")]
    VaultTransfer {
        from_vault: bool,
        from_slot: u8,
        to_slot: u8,
    },
    CloseVault,
}

/// Messages the server may send to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Snapshot {
        tick: u64,
        players: Vec<PlayerView>,
        enemies: Vec<EnemyView>,
        projectiles: Vec<ProjectileView>,
        loot: Vec<LootView>,
        portals: Vec<PortalView>,
        chests: Vec<ChestView>,
    },
    #[serde(rename_all = "camelCase")]
    Damage { target: Uuid, amount: i32 },
    #[serde(rename_all = "camelCase")]
    Death { killed_by: String },
    #[serde(rename_all = "camelCase")]
    LootSpawn { bag: LootView },
    #[serde(rename_all = "camelCase")]
    LevelUp { level: u32, max_hp: i32, max_mp: i32 },
    #[serde(rename_all = "camelCase")]
    AbilityEffect {
        player: Uuid,
        ability: String,
        x: f32,
        y: f32,
    },
    #[serde(rename_all = "camelCase")]
    AuthResult {
        success: bool,
        token: Option<String>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    RegisterResult { success: bool, message: String },
    #[serde(rename_all = "camelCase")]
    CharacterList { characters: Vec<CharacterSummary> },
    #[serde(rename_all = "camelCase")]
    InstanceChange {
        instance: String,
        kind: InstanceKind,
        width: u32,
        height: u32,
        tiles: Vec<u8>,
        spawn_x: f32,
        spawn_y: f32,
        player: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Chat { from: String, message: String },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    VaultOpen { items: Vec<Option<String>> },
    #[serde(rename_all = "camelCase")]
    VaultUpdate { items: Vec<Option<String>> },
}

/// One alive character, as shown on the character-select screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSummary {
    pub id: Uuid,
    pub class_id: String,
    pub level: u32,
}

/// Player fields replicated inside the area of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: Uuid,
    pub name: String,
    pub class_id: String,
    pub x: f32,
    pub y: f32,
    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnemyView {
    pub id: Uuid,
    pub def_id: String,
    pub x: f32,
    pub y: f32,
    pub hp: i32,
    pub max_hp: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileView {
    pub id: Uuid,
    pub owner: Uuid,
    pub from_enemy: bool,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LootView {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalView {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub kind: InstanceKind,
    pub name: String,
    pub visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChestView {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not an object envelope")]
    NotAnObject,
    #[error("frame contains forbidden key {0:?}")]
    ForbiddenKey(String),
}

/// Encodes an outbound message as self-describing MessagePack.
pub fn encode(msg: &ServerMessage) -> Vec<u8> {
    encode_frame(msg)
}

/// Client-side encoding, for test drivers and native clients. Uses the
/// identical framing configuration as [`encode`].
pub fn encode_client(msg: &ClientMessage) -> Vec<u8> {
    encode_frame(msg)
}

/// Struct field names must be on the wire for the envelope to stay
/// self-describing, and ids must encode as strings exactly as they do on
/// the JSON fallback path, hence struct-map + human-readable mode.
fn encode_frame<T: serde::Serialize>(msg: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut ser = rmp_serde::Serializer::new(&mut buf)
        .with_struct_map()
        .with_human_readable();
    msg.serialize(&mut ser).expect("message is always encodable");
    buf
}

/// Decodes an inbound MessagePack binary frame.
pub fn decode(bytes: &[u8]) -> Result<ClientMessage, FrameError> {
    let mut de = rmp_serde::Deserializer::from_read_ref(bytes).with_human_readable();
    let value = serde_json::Value::deserialize(&mut de)
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decodes an outbound frame back into a [`ServerMessage`]; the client-side
/// half of [`encode`].
pub fn decode_server(bytes: &[u8]) -> Result<ServerMessage, FrameError> {
    let mut de = rmp_serde::Deserializer::from_read_ref(bytes).with_human_readable();
    ServerMessage::deserialize(&mut de).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Decodes an inbound JSON text frame (inbound-only fallback).
pub fn decode_json(text: &str) -> Result<ClientMessage, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    decode_value(value)
}

fn decode_value(value: serde_json::Value) -> Result<ClientMessage, FrameError> {
    let map = value.as_object().ok_or(FrameError::NotAnObject)?;
    for key in map.keys() {
        if POLLUTION_SENTINELS.contains(&key.as_str()) {
            return Err(FrameError::ForbiddenKey(key.clone()));
        }
    }
    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}
