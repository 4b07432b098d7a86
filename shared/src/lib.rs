//! # Shared Game Library
//!
//! Data structures, constants and utilities that the authoritative server and
//! any client must agree on. It defines the wire protocol, the snapshot views
//! replicated to clients, the tile codes carried in instance-change payloads,
//! and the tunable constants that shape the simulation.
//!
//! ## Core Components
//!
//! ### Tunable Constants
//! Every gameplay constant with cross-boundary meaning lives here: the tick
//! rate, the area-of-interest radius, interaction ranges, inventory and vault
//! sizes, and the rate-limit windows enforced by the session layer.
//!
//! ### Network Protocol
//! [`protocol::ClientMessage`] and [`protocol::ServerMessage`] define the
//! complete message taxonomy. Every frame on the wire is a self-describing
//! `{type, data}` envelope, encoded as MessagePack for transmission and
//! accepted as JSON text on the inbound path only.
//!
//! ### Geometry
//! [`Vec2`] is the 2D vector used for all positions and directions. One world
//! unit is one tile.
//!
//! ## Design Philosophy
//!
//! The server is the single authority; nothing in this crate mutates game
//! state. Clients render the snapshot views verbatim and predict only their
//! own movement.

use serde::{Deserialize, Serialize};

pub mod protocol;

/// Simulation rate in ticks per second. Snapshots are emitted at half rate.
pub const TICK_RATE: u32 = 20;

/// Area-of-interest radius in tiles; entities beyond it are not replicated.
pub const AOI_RADIUS: f32 = 15.0;

/// Maximum distance at which a loot bag can be picked up.
pub const PICKUP_RANGE: f32 = 1.0;

/// Maximum distance at which a portal can be entered.
pub const PORTAL_INTERACT_RANGE: f32 = 1.5;

/// Maximum distance at which the vault chest can be opened.
pub const VAULT_CHEST_INTERACT_RANGE: f32 = 1.5;

/// Collision radius of every player entity, in tiles.
pub const PLAYER_RADIUS: f32 = 0.35;

/// Level cap.
pub const MAX_LEVEL: u32 = 20;

/// Equipment slot count: weapon, ability, armor, ring.
pub const EQUIP_SLOTS: usize = 4;

/// Inventory slot count.
pub const INVENTORY_SIZE: usize = 8;

/// Vault slot count per account.
pub const VAULT_SIZE: usize = 8;

/// Maximum alive characters per class per account.
pub const MAX_ALIVE_PER_CLASS: usize = 2;

/// Maximum accepted chat message length, in characters.
pub const CHAT_MAX_LEN: usize = 200;

/// Auth attempts allowed per connection per window.
pub const AUTH_ATTEMPT_LIMIT: u32 = 5;

/// Auth rate-limit window in seconds.
pub const AUTH_ATTEMPT_WINDOW_SECS: u64 = 60;

/// Messages arriving closer together than this count toward a burst.
pub const INPUT_BURST_WINDOW_MS: u64 = 10;

/// Burst size beyond which inbound messages are dropped.
pub const INPUT_BURST_LIMIT: u32 = 100;

/// Lifetime of a dropped dungeon portal, in seconds.
pub const DUNGEON_PORTAL_EXPIRY_SECS: f64 = 120.0;

/// Lifetime of a loot bag on the ground, in seconds.
pub const LOOT_DESPAWN_SECS: f64 = 60.0;

/// Fraction of an enemy's max hp a player must deal to qualify for
/// soulbound drops.
pub const SOULBOUND_THRESHOLD: f64 = 0.05;

/// Session token lifetime in seconds (30 days).
pub const SESSION_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// Tile codes for the flat grid carried by instance-change payloads.
///
/// The numeric values are part of the wire contract; clients index their
/// tile atlas by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tile {
    Void = 0,
    Floor = 1,
    Wall = 2,
    Water = 3,
    Lava = 4,
    Spawn = 5,
    BossFloor = 6,
}

impl Tile {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Tile {
        match code {
            1 => Tile::Floor,
            2 => Tile::Wall,
            3 => Tile::Water,
            4 => Tile::Lava,
            5 => Tile::Spawn,
            6 => Tile::BossFloor,
            _ => Tile::Void,
        }
    }

    /// Entities may occupy every tile that is not solid or missing.
    pub fn is_walkable(self) -> bool {
        !matches!(self, Tile::Void | Tile::Wall)
    }
}

/// The four kinds of world an instance can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Nexus,
    Realm,
    Dungeon,
    Vault,
}

/// 2D vector in tile units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Vec2 {
        Vec2 { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn normalize(&self) -> Vec2 {
        let mag = self.length();
        if mag == 0.0 {
            Vec2::ZERO
        } else {
            Vec2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    pub fn scale(&self, scalar: f32) -> Vec2 {
        Vec2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    pub fn distance(&self, other: Vec2) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Unit vector pointing at `angle` radians, counterclockwise from +x.
    pub fn from_angle(angle: f32) -> Vec2 {
        Vec2 {
            x: angle.cos(),
            y: angle.sin(),
        }
    }

    /// Angle of this vector in radians, counterclockwise from +x.
    pub fn angle(&self) -> f32 {
        self.y.atan2(self.x)
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Angles for a fan of `count` projectiles around `aim`, spaced `gap`
/// radians apart.
///
/// Odd counts center one projectile on the aim angle; even counts are
/// symmetric around it, which leaves the aim line itself clear.
pub fn fan_angles(aim: f32, count: u32, gap: f32) -> Vec<f32> {
    let n = count.max(1);
    (0..n)
        .map(|i| aim + (i as f32 - (n as f32 - 1.0) / 2.0) * gap)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_vec2_normalize() {
        let v = Vec2::new(3.0, 4.0);
        let n = v.normalize();
        assert_approx_eq!(n.length(), 1.0, 1e-6);
        assert_approx_eq!(n.x, 0.6, 1e-6);
        assert_approx_eq!(n.y, 0.8, 1e-6);
    }

    #[test]
    fn test_vec2_normalize_zero() {
        let n = Vec2::ZERO.normalize();
        assert_eq!(n.x, 0.0);
        assert_eq!(n.y, 0.0);
    }

    #[test]
    fn test_vec2_distance() {
        let a = Vec2::new(1.0, 1.0);
        let b = Vec2::new(4.0, 5.0);
        assert_approx_eq!(a.distance(b), 5.0, 1e-6);
    }

    #[test]
    fn test_tile_roundtrip() {
        for code in 0u8..=6 {
            assert_eq!(Tile::from_u8(code).to_u8(), code);
        }
        assert_eq!(Tile::from_u8(250), Tile::Void);
    }

    #[test]
    fn test_tile_walkability() {
        assert!(Tile::Floor.is_walkable());
        assert!(Tile::Spawn.is_walkable());
        assert!(Tile::BossFloor.is_walkable());
        assert!(Tile::Water.is_walkable());
        assert!(Tile::Lava.is_walkable());
        assert!(!Tile::Wall.is_walkable());
        assert!(!Tile::Void.is_walkable());
    }

    #[test]
    fn test_fan_angles_odd_centers_on_aim() {
        let angles = fan_angles(1.5, 3, 0.2);
        assert_eq!(angles.len(), 3);
        assert_approx_eq!(angles[1], 1.5, 1e-6);
        assert_approx_eq!(angles[0], 1.3, 1e-6);
        assert_approx_eq!(angles[2], 1.7, 1e-6);
    }

    #[test]
    fn test_fan_angles_even_offsets_half_gap() {
        let angles = fan_angles(0.0, 2, 0.2);
        assert_eq!(angles.len(), 2);
        // No projectile travels exactly along the aim angle.
        assert_approx_eq!(angles[0], -0.1, 1e-6);
        assert_approx_eq!(angles[1], 0.1, 1e-6);
    }

    #[test]
    fn test_fan_angles_zero_count_fires_one() {
        let angles = fan_angles(1.0, 0, 0.5);
        assert_eq!(angles.len(), 1);
        assert_approx_eq!(angles[0], 1.0, 1e-6);
    }
}
