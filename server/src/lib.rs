//! # Realm Server Library
//!
//! The authoritative simulation and delivery pipeline for a multiplayer
//! top-down shooter. The server owns every game world ("instance"), resolves
//! all movement and combat, and streams area-of-interest filtered snapshots
//! to each connected client at a fixed cadence. Clients render and predict;
//! they never produce authoritative state.
//!
//! ## Architecture
//!
//! A single game-loop task drives everything. Network tasks (one reader and
//! one writer per WebSocket connection) translate frames into commands and
//! push them over a channel; the game loop drains the channel, ticks every
//! registered instance at 20 Hz, and routes the resulting events back to the
//! per-connection writer handles. Instances are therefore exclusive over
//! their entities and all state is quiescent between ticks.
//!
//! ## Module Organization
//!
//! - [`content`]: immutable definition tables (classes, items, enemies,
//!   dungeons) loaded once at startup and shared behind `Arc`.
//! - [`map`]: tile grids, walkability, spawn regions and the builders for
//!   the standing worlds.
//! - [`dungeon`]: procedural dungeon layout generation.
//! - [`entity`]: the concrete entity kinds — players, enemies, projectiles,
//!   loot bags, portals and vault chests.
//! - [`instance`]: one world's entity containers and its per-tick update
//!   pipeline (entities, combat, spawns, cleanup, snapshots).
//! - [`tick`]: the fixed-rate ticker.
//! - [`session`]: WebSocket accept, framing, rate limits and message
//!   dispatch.
//! - [`server`]: orchestration — standing instances, portal transfers,
//!   dungeon and vault lifecycle, admin commands, autosave.
//! - [`persistence`]: the opaque account/character/session/vault store.
//! - [`admin`]: the file-watched admin allowlist and chat command parser.

pub mod admin;
pub mod content;
pub mod dungeon;
pub mod entity;
pub mod instance;
pub mod map;
pub mod persistence;
pub mod server;
pub mod session;
pub mod tick;
