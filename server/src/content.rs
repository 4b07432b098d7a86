//! Immutable game content: classes, items, enemies and dungeon definitions.
//!
//! Content is built once at startup by [`ContentTables::builtin`] and shared
//! read-only behind an `Arc` for the life of the process. Gameplay code never
//! mutates a definition; everything dynamic lives on the entities.
//!
//! Ids are short snake_case strings and double as the wire representation.

use std::collections::HashMap;

use crate::entity::player::StatBlock;

/// Experience required to *reach* `level`.
///
/// A character levels up when its banked exp reaches the requirement of the
/// next level.
pub fn exp_for_level(level: u32) -> i64 {
    (100.0 * 1.2f64.powi(level as i32 - 1)).floor() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponType {
    Staff,
    Bow,
    Sword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbilityType {
    Spell,
    Quiver,
    Helm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmorType {
    Robe,
    Leather,
    Heavy,
}

/// Which base stat a bonus or buff applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatKind {
    Attack,
    Defense,
    Speed,
    Dexterity,
    Vitality,
    Wisdom,
}

/// Flat stat contributions from a worn item.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatBonuses {
    pub attack: i32,
    pub defense: i32,
    pub speed: i32,
    pub dexterity: i32,
    pub vitality: i32,
    pub wisdom: i32,
    pub max_hp: i32,
    pub max_mp: i32,
}

impl StatBonuses {
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
}

#[derive(Debug, Clone)]
pub struct WeaponDef {
    pub weapon_type: WeaponType,
    pub min_damage: i32,
    pub max_damage: i32,
    /// Shots per second.
    pub rate_of_fire: f32,
    pub num_projectiles: u32,
    /// Fan spacing in degrees.
    pub arc_gap_deg: f32,
    /// Travel distance in tiles; lifetime is range / projectile speed.
    pub range: f32,
    pub projectile: String,
    pub pierce: bool,
}

#[derive(Debug, Clone)]
pub enum AbilityEffect {
    /// Damages every enemy within `radius` of the caster.
    Damage { amount: i32, radius: f32 },
    /// Temporary stat buff on the caster.
    Buff {
        stat: StatKind,
        amount: i32,
        duration: f32,
    },
    /// Restores hp.
    Heal { amount: i32 },
    /// Moves the caster up to `range` tiles along the aim angle.
    Teleport { range: f32 },
}

#[derive(Debug, Clone)]
pub struct AbilityDef {
    pub ability_type: AbilityType,
    pub mp_cost: i32,
    pub cooldown: f32,
    pub effect: AbilityEffect,
}

#[derive(Debug, Clone)]
pub struct ArmorDef {
    pub armor_type: ArmorType,
    pub bonuses: StatBonuses,
}

#[derive(Debug, Clone)]
pub struct RingDef {
    pub bonuses: StatBonuses,
}

#[derive(Debug, Clone)]
pub enum ItemKind {
    Weapon(WeaponDef),
    Ability(AbilityDef),
    Armor(ArmorDef),
    Ring(RingDef),
    /// Drops with no equip slot; vendor trash and trophies.
    Misc,
}

#[derive(Debug, Clone)]
pub struct ItemDef {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub soulbound: bool,
}

impl ItemDef {
    pub fn as_weapon(&self) -> Option<&WeaponDef> {
        match &self.kind {
            ItemKind::Weapon(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_ability(&self) -> Option<&AbilityDef> {
        match &self.kind {
            ItemKind::Ability(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_armor(&self) -> Option<&ArmorDef> {
        match &self.kind {
            ItemKind::Armor(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_ring(&self) -> Option<&RingDef> {
        match &self.kind {
            ItemKind::Ring(r) => Some(r),
            _ => None,
        }
    }

    /// Stat bonuses this item grants while equipped.
    pub fn bonuses(&self) -> StatBonuses {
        match &self.kind {
            ItemKind::Armor(a) => a.bonuses,
            ItemKind::Ring(r) => r.bonuses,
            _ => StatBonuses::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub id: String,
    pub name: String,
    pub weapon_type: WeaponType,
    pub ability_type: AbilityType,
    pub armor_type: ArmorType,
    pub base_hp: i32,
    pub base_mp: i32,
    pub hp_per_level: i32,
    pub mp_per_level: i32,
    pub base_stats: StatBlock,
    pub growth_per_level: StatBlock,
    /// weapon, ability, armor, ring — item ids or empty.
    pub starting_equipment: [Option<String>; 4],
}

/// Outer movement state an enemy kind runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnemyBehavior {
    Wander,
    Chase,
    Orbit,
    Stationary,
}

#[derive(Debug, Clone)]
pub struct AttackDef {
    pub projectile: String,
    pub min_damage: i32,
    pub max_damage: i32,
    /// Shots per second.
    pub rate_of_fire: f32,
    pub num_projectiles: u32,
    /// Fan spacing in degrees.
    pub arc_gap_deg: f32,
    /// Fires only while the target is within this many tiles.
    pub range: f32,
    /// Lead the target using its observed input direction and speed.
    pub predictive: bool,
}

/// One hp-gated slice of a boss's repertoire. Phases are stored in
/// descending hp-threshold order.
#[derive(Debug, Clone)]
pub struct PhaseDef {
    /// Active while current hp percentage is at or below this threshold.
    pub hp_percent: f32,
    pub attack_indices: Vec<usize>,
    pub attack_duration: f32,
    pub rest_duration: f32,
}

#[derive(Debug, Clone)]
pub struct LootEntry {
    pub item: String,
    /// Independent drop chance per kill.
    pub chance: f64,
}

#[derive(Debug, Clone)]
pub struct EnemyDef {
    pub id: String,
    pub name: String,
    pub max_hp: i32,
    pub defense: i32,
    pub xp: i32,
    pub radius: f32,
    pub speed: f32,
    /// Behavior radius: chase leash / orbit distance.
    pub range: f32,
    pub behavior: EnemyBehavior,
    /// Radians per second; only meaningful for orbiters.
    pub orbit_speed: f32,
    pub attacks: Vec<AttackDef>,
    pub phases: Vec<PhaseDef>,
    pub loot: Vec<LootEntry>,
    /// Killing this enemy may open a dungeon: (dungeon id, chance).
    pub opens_dungeon: Option<(String, f64)>,
    /// Boss kills latch the dungeon cleared state and open a return portal.
    pub is_boss: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectileDef {
    pub id: String,
    /// Tiles per second.
    pub speed: f32,
    pub radius: f32,
}

#[derive(Debug, Clone)]
pub struct DungeonDef {
    pub id: String,
    pub name: String,
    pub width: usize,
    pub height: usize,
    pub min_rooms: usize,
    pub max_rooms: usize,
    pub room_min: usize,
    pub room_max: usize,
    pub gap_min: usize,
    pub gap_max: usize,
    pub minion: String,
    pub guardian: String,
    pub boss: String,
}

/// Every definition table, immutable after startup.
#[derive(Debug)]
pub struct ContentTables {
    pub classes: HashMap<String, ClassDef>,
    pub items: HashMap<String, ItemDef>,
    pub enemies: HashMap<String, EnemyDef>,
    pub projectiles: HashMap<String, ProjectileDef>,
    pub dungeons: HashMap<String, DungeonDef>,
}

impl ContentTables {
    pub fn class(&self, id: &str) -> Option<&ClassDef> {
        self.classes.get(id)
    }

    pub fn item(&self, id: &str) -> Option<&ItemDef> {
        self.items.get(id)
    }

    pub fn enemy(&self, id: &str) -> Option<&EnemyDef> {
        self.enemies.get(id)
    }

    pub fn projectile(&self, id: &str) -> Option<&ProjectileDef> {
        self.projectiles.get(id)
    }

    pub fn dungeon(&self, id: &str) -> Option<&DungeonDef> {
        self.dungeons.get(id)
    }

    /// The full builtin content set.
    pub fn builtin() -> ContentTables {
        let mut tables = ContentTables {
            classes: HashMap::new(),
            items: HashMap::new(),
            enemies: HashMap::new(),
            projectiles: HashMap::new(),
            dungeons: HashMap::new(),
        };
        tables.register_projectiles();
        tables.register_items();
        tables.register_classes();
        tables.register_enemies();
        tables.register_dungeons();
        tables
    }

    fn add_item(&mut self, id: &str, name: &str, soulbound: bool, kind: ItemKind) {
        self.items.insert(
            id.to_string(),
            ItemDef {
                id: id.to_string(),
                name: name.to_string(),
                kind,
                soulbound,
            },
        );
    }

    fn register_projectiles(&mut self) {
        for (id, speed, radius) in [
            ("bolt_small", 12.0, 0.15),
            ("bolt_heavy", 9.0, 0.25),
            ("arrow", 14.0, 0.12),
            ("blade_wave", 10.0, 0.3),
            ("cannonball", 8.0, 0.3),
            ("fire_spit", 7.5, 0.2),
            ("cube_shard", 10.0, 0.2),
            ("cube_beam", 13.0, 0.25),
        ] {
            self.projectiles.insert(
                id.to_string(),
                ProjectileDef {
                    id: id.to_string(),
                    speed,
                    radius,
                },
            );
        }
    }

    fn register_items(&mut self) {
        // Weapons.
        self.add_item(
            "starter_staff",
            "Cracked Staff",
            false,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Staff,
                min_damage: 15,
                max_damage: 25,
                rate_of_fire: 2.5,
                num_projectiles: 1,
                arc_gap_deg: 0.0,
                range: 8.0,
                projectile: "bolt_small".to_string(),
                pierce: false,
            }),
        );
        self.add_item(
            "ember_staff",
            "Ember Staff",
            false,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Staff,
                min_damage: 30,
                max_damage: 45,
                rate_of_fire: 2.5,
                num_projectiles: 2,
                arc_gap_deg: 8.0,
                range: 8.5,
                projectile: "bolt_small".to_string(),
                pierce: false,
            }),
        );
        self.add_item(
            "starter_bow",
            "Worn Shortbow",
            false,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Bow,
                min_damage: 10,
                max_damage: 18,
                rate_of_fire: 3.3,
                num_projectiles: 1,
                arc_gap_deg: 0.0,
                range: 7.0,
                projectile: "arrow".to_string(),
                pierce: true,
            }),
        );
        self.add_item(
            "recurve_bow",
            "Recurve Bow",
            false,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Bow,
                min_damage: 18,
                max_damage: 26,
                rate_of_fire: 3.3,
                num_projectiles: 3,
                arc_gap_deg: 10.0,
                range: 7.0,
                projectile: "arrow".to_string(),
                pierce: true,
            }),
        );
        self.add_item(
            "starter_sword",
            "Rusty Blade",
            false,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Sword,
                min_damage: 28,
                max_damage: 40,
                rate_of_fire: 2.0,
                num_projectiles: 1,
                arc_gap_deg: 0.0,
                range: 3.5,
                projectile: "blade_wave".to_string(),
                pierce: false,
            }),
        );
        self.add_item(
            "cube_edge",
            "Edge of the Cube",
            true,
            ItemKind::Weapon(WeaponDef {
                weapon_type: WeaponType::Sword,
                min_damage: 45,
                max_damage: 60,
                rate_of_fire: 2.0,
                num_projectiles: 1,
                arc_gap_deg: 0.0,
                range: 3.8,
                projectile: "blade_wave".to_string(),
                pierce: false,
            }),
        );

        // Abilities, one archetype per effect.
        self.add_item(
            "fire_nova",
            "Spell: Fire Nova",
            false,
            ItemKind::Ability(AbilityDef {
                ability_type: AbilityType::Spell,
                mp_cost: 25,
                cooldown: 1.0,
                effect: AbilityEffect::Damage {
                    amount: 80,
                    radius: 4.0,
                },
            }),
        );
        self.add_item(
            "blink_scroll",
            "Spell: Blink",
            false,
            ItemKind::Ability(AbilityDef {
                ability_type: AbilityType::Spell,
                mp_cost: 30,
                cooldown: 2.0,
                effect: AbilityEffect::Teleport { range: 8.0 },
            }),
        );
        self.add_item(
            "piercing_quiver",
            "Quiver of Swiftness",
            false,
            ItemKind::Ability(AbilityDef {
                ability_type: AbilityType::Quiver,
                mp_cost: 20,
                cooldown: 3.0,
                effect: AbilityEffect::Buff {
                    stat: StatKind::Dexterity,
                    amount: 10,
                    duration: 4.0,
                },
            }),
        );
        self.add_item(
            "battle_helm",
            "Helm of Battle",
            false,
            ItemKind::Ability(AbilityDef {
                ability_type: AbilityType::Helm,
                mp_cost: 20,
                cooldown: 5.0,
                effect: AbilityEffect::Buff {
                    stat: StatKind::Speed,
                    amount: 15,
                    duration: 3.0,
                },
            }),
        );
        self.add_item(
            "mending_helm",
            "Helm of Mending",
            false,
            ItemKind::Ability(AbilityDef {
                ability_type: AbilityType::Helm,
                mp_cost: 35,
                cooldown: 4.0,
                effect: AbilityEffect::Heal { amount: 60 },
            }),
        );

        // Armors.
        self.add_item(
            "cloth_robe",
            "Cloth Robe",
            false,
            ItemKind::Armor(ArmorDef {
                armor_type: ArmorType::Robe,
                bonuses: StatBonuses {
                    defense: 2,
                    wisdom: 2,
                    ..Default::default()
                },
            }),
        );
        self.add_item(
            "leather_armor",
            "Leather Armor",
            false,
            ItemKind::Armor(ArmorDef {
                armor_type: ArmorType::Leather,
                bonuses: StatBonuses {
                    defense: 5,
                    dexterity: 1,
                    ..Default::default()
                },
            }),
        );
        self.add_item(
            "plate_mail",
            "Plate Mail",
            false,
            ItemKind::Armor(ArmorDef {
                armor_type: ArmorType::Heavy,
                bonuses: StatBonuses {
                    defense: 9,
                    max_hp: 20,
                    ..Default::default()
                },
            }),
        );
        self.add_item(
            "cube_carapace",
            "Cube Carapace",
            true,
            ItemKind::Armor(ArmorDef {
                armor_type: ArmorType::Heavy,
                bonuses: StatBonuses {
                    defense: 14,
                    max_hp: 40,
                    ..Default::default()
                },
            }),
        );

        // Rings.
        self.add_item(
            "ring_of_speed",
            "Ring of Speed",
            false,
            ItemKind::Ring(RingDef {
                bonuses: StatBonuses {
                    speed: 4,
                    ..Default::default()
                },
            }),
        );
        self.add_item(
            "ring_of_vitality",
            "Ring of Vitality",
            false,
            ItemKind::Ring(RingDef {
                bonuses: StatBonuses {
                    vitality: 4,
                    max_hp: 20,
                    ..Default::default()
                },
            }),
        );
        self.add_item(
            "ring_of_attack",
            "Ring of Attack",
            false,
            ItemKind::Ring(RingDef {
                bonuses: StatBonuses {
                    attack: 4,
                    ..Default::default()
                },
            }),
        );

        // Misc drops.
        self.add_item("health_potion", "Health Potion", false, ItemKind::Misc);
        self.add_item("magic_potion", "Magic Potion", false, ItemKind::Misc);
        self.add_item("pirate_doubloon", "Pirate Doubloon", false, ItemKind::Misc);
    }

    fn register_classes(&mut self) {
        self.classes.insert(
            "wizard".to_string(),
            ClassDef {
                id: "wizard".to_string(),
                name: "Wizard".to_string(),
                weapon_type: WeaponType::Staff,
                ability_type: AbilityType::Spell,
                armor_type: ArmorType::Robe,
                base_hp: 100,
                base_mp: 100,
                hp_per_level: 20,
                mp_per_level: 10,
                base_stats: StatBlock {
                    attack: 15,
                    defense: 0,
                    speed: 10,
                    dexterity: 15,
                    vitality: 10,
                    wisdom: 12,
                },
                growth_per_level: StatBlock {
                    attack: 2,
                    defense: 0,
                    speed: 1,
                    dexterity: 1,
                    vitality: 1,
                    wisdom: 2,
                },
                starting_equipment: [
                    Some("starter_staff".to_string()),
                    Some("fire_nova".to_string()),
                    Some("cloth_robe".to_string()),
                    None,
                ],
            },
        );
        self.classes.insert(
            "archer".to_string(),
            ClassDef {
                id: "archer".to_string(),
                name: "Archer".to_string(),
                weapon_type: WeaponType::Bow,
                ability_type: AbilityType::Quiver,
                armor_type: ArmorType::Leather,
                base_hp: 130,
                base_mp: 75,
                hp_per_level: 25,
                mp_per_level: 5,
                base_stats: StatBlock {
                    attack: 12,
                    defense: 2,
                    speed: 12,
                    dexterity: 18,
                    vitality: 12,
                    wisdom: 8,
                },
                growth_per_level: StatBlock {
                    attack: 2,
                    defense: 1,
                    speed: 1,
                    dexterity: 2,
                    vitality: 1,
                    wisdom: 1,
                },
                starting_equipment: [
                    Some("starter_bow".to_string()),
                    Some("piercing_quiver".to_string()),
                    Some("leather_armor".to_string()),
                    None,
                ],
            },
        );
        self.classes.insert(
            "knight".to_string(),
            ClassDef {
                id: "knight".to_string(),
                name: "Knight".to_string(),
                weapon_type: WeaponType::Sword,
                ability_type: AbilityType::Helm,
                armor_type: ArmorType::Heavy,
                base_hp: 160,
                base_mp: 60,
                hp_per_level: 30,
                mp_per_level: 5,
                base_stats: StatBlock {
                    attack: 14,
                    defense: 8,
                    speed: 8,
                    dexterity: 10,
                    vitality: 15,
                    wisdom: 5,
                },
                growth_per_level: StatBlock {
                    attack: 2,
                    defense: 1,
                    speed: 1,
                    dexterity: 1,
                    vitality: 2,
                    wisdom: 1,
                },
                starting_equipment: [
                    Some("starter_sword".to_string()),
                    Some("battle_helm".to_string()),
                    Some("plate_mail".to_string()),
                    None,
                ],
            },
        );
    }

    fn register_enemies(&mut self) {
        self.enemies.insert(
            "pirate".to_string(),
            EnemyDef {
                id: "pirate".to_string(),
                name: "Pirate".to_string(),
                max_hp: 100,
                defense: 2,
                xp: 20,
                radius: 0.5,
                speed: 2.4,
                range: 9.0,
                behavior: EnemyBehavior::Chase,
                orbit_speed: 0.0,
                attacks: vec![AttackDef {
                    projectile: "bolt_small".to_string(),
                    min_damage: 8,
                    max_damage: 14,
                    rate_of_fire: 1.0,
                    num_projectiles: 1,
                    arc_gap_deg: 0.0,
                    range: 7.0,
                    predictive: false,
                }],
                phases: vec![],
                loot: vec![
                    LootEntry {
                        item: "pirate_doubloon".to_string(),
                        chance: 0.4,
                    },
                    LootEntry {
                        item: "health_potion".to_string(),
                        chance: 0.15,
                    },
                    LootEntry {
                        item: "starter_bow".to_string(),
                        chance: 0.05,
                    },
                ],
                opens_dungeon: None,
                is_boss: false,
            },
        );
        self.enemies.insert(
            "pirate_deckhand".to_string(),
            EnemyDef {
                id: "pirate_deckhand".to_string(),
                name: "Pirate Deckhand".to_string(),
                max_hp: 60,
                defense: 0,
                xp: 10,
                radius: 0.4,
                speed: 2.8,
                range: 8.0,
                behavior: EnemyBehavior::Wander,
                orbit_speed: 0.0,
                attacks: vec![AttackDef {
                    projectile: "bolt_small".to_string(),
                    min_damage: 5,
                    max_damage: 9,
                    rate_of_fire: 0.8,
                    num_projectiles: 1,
                    arc_gap_deg: 0.0,
                    range: 6.0,
                    predictive: false,
                }],
                phases: vec![],
                loot: vec![LootEntry {
                    item: "health_potion".to_string(),
                    chance: 0.1,
                }],
                opens_dungeon: None,
                is_boss: false,
            },
        );
        self.enemies.insert(
            "sand_guardian".to_string(),
            EnemyDef {
                id: "sand_guardian".to_string(),
                name: "Sand Guardian".to_string(),
                max_hp: 220,
                defense: 6,
                xp: 45,
                radius: 0.6,
                speed: 3.0,
                range: 3.5,
                behavior: EnemyBehavior::Orbit,
                orbit_speed: 1.6,
                attacks: vec![AttackDef {
                    projectile: "bolt_heavy".to_string(),
                    min_damage: 14,
                    max_damage: 22,
                    rate_of_fire: 1.4,
                    num_projectiles: 2,
                    arc_gap_deg: 14.0,
                    range: 5.0,
                    predictive: false,
                }],
                phases: vec![],
                loot: vec![
                    LootEntry {
                        item: "leather_armor".to_string(),
                        chance: 0.12,
                    },
                    LootEntry {
                        item: "magic_potion".to_string(),
                        chance: 0.2,
                    },
                ],
                opens_dungeon: None,
                is_boss: false,
            },
        );
        self.enemies.insert(
            "demon".to_string(),
            EnemyDef {
                id: "demon".to_string(),
                name: "Demon".to_string(),
                max_hp: 800,
                defense: 12,
                xp: 150,
                radius: 0.8,
                speed: 2.0,
                range: 11.0,
                behavior: EnemyBehavior::Chase,
                orbit_speed: 0.0,
                attacks: vec![
                    AttackDef {
                        projectile: "fire_spit".to_string(),
                        min_damage: 22,
                        max_damage: 32,
                        rate_of_fire: 1.2,
                        num_projectiles: 3,
                        arc_gap_deg: 12.0,
                        range: 8.0,
                        predictive: false,
                    },
                    AttackDef {
                        projectile: "bolt_heavy".to_string(),
                        min_damage: 35,
                        max_damage: 45,
                        rate_of_fire: 0.5,
                        num_projectiles: 1,
                        arc_gap_deg: 0.0,
                        range: 10.0,
                        predictive: true,
                    },
                ],
                phases: vec![],
                loot: vec![
                    LootEntry {
                        item: "ember_staff".to_string(),
                        chance: 0.1,
                    },
                    LootEntry {
                        item: "ring_of_attack".to_string(),
                        chance: 0.08,
                    },
                    LootEntry {
                        item: "magic_potion".to_string(),
                        chance: 0.5,
                    },
                ],
                opens_dungeon: Some(("cube_dungeon".to_string(), 0.1)),
                is_boss: false,
            },
        );
        self.enemies.insert(
            "cube_minion".to_string(),
            EnemyDef {
                id: "cube_minion".to_string(),
                name: "Cube Minion".to_string(),
                max_hp: 90,
                defense: 3,
                xp: 18,
                radius: 0.45,
                speed: 3.2,
                range: 9.0,
                behavior: EnemyBehavior::Chase,
                orbit_speed: 0.0,
                attacks: vec![AttackDef {
                    projectile: "cube_shard".to_string(),
                    min_damage: 10,
                    max_damage: 16,
                    rate_of_fire: 1.1,
                    num_projectiles: 1,
                    arc_gap_deg: 0.0,
                    range: 6.5,
                    predictive: false,
                }],
                phases: vec![],
                loot: vec![LootEntry {
                    item: "magic_potion".to_string(),
                    chance: 0.12,
                }],
                opens_dungeon: None,
                is_boss: false,
            },
        );
        self.enemies.insert(
            "cube_guardian".to_string(),
            EnemyDef {
                id: "cube_guardian".to_string(),
                name: "Cube Guardian".to_string(),
                max_hp: 320,
                defense: 8,
                xp: 60,
                radius: 0.6,
                speed: 2.6,
                range: 4.0,
                behavior: EnemyBehavior::Orbit,
                orbit_speed: 1.2,
                attacks: vec![AttackDef {
                    projectile: "cube_shard".to_string(),
                    min_damage: 18,
                    max_damage: 26,
                    rate_of_fire: 1.6,
                    num_projectiles: 4,
                    arc_gap_deg: 18.0,
                    range: 5.5,
                    predictive: false,
                }],
                phases: vec![],
                loot: vec![
                    LootEntry {
                        item: "health_potion".to_string(),
                        chance: 0.25,
                    },
                    LootEntry {
                        item: "ring_of_vitality".to_string(),
                        chance: 0.06,
                    },
                ],
                opens_dungeon: None,
                is_boss: false,
            },
        );
        self.enemies.insert(
            "cube_overlord".to_string(),
            EnemyDef {
                id: "cube_overlord".to_string(),
                name: "Cube Overlord".to_string(),
                max_hp: 4000,
                defense: 15,
                xp: 800,
                radius: 1.2,
                speed: 1.6,
                range: 6.0,
                behavior: EnemyBehavior::Stationary,
                orbit_speed: 0.0,
                attacks: vec![
                    AttackDef {
                        projectile: "cube_shard".to_string(),
                        min_damage: 25,
                        max_damage: 35,
                        rate_of_fire: 1.5,
                        num_projectiles: 8,
                        arc_gap_deg: 45.0,
                        range: 12.0,
                        predictive: false,
                    },
                    AttackDef {
                        projectile: "cube_beam".to_string(),
                        min_damage: 50,
                        max_damage: 65,
                        rate_of_fire: 0.8,
                        num_projectiles: 2,
                        arc_gap_deg: 10.0,
                        range: 12.0,
                        predictive: true,
                    },
                    AttackDef {
                        projectile: "cannonball".to_string(),
                        min_damage: 70,
                        max_damage: 90,
                        rate_of_fire: 0.4,
                        num_projectiles: 1,
                        arc_gap_deg: 0.0,
                        range: 12.0,
                        predictive: true,
                    },
                ],
                // Descending thresholds; the last matching entry wins.
                phases: vec![
                    PhaseDef {
                        hp_percent: 100.0,
                        attack_indices: vec![0],
                        attack_duration: 3.0,
                        rest_duration: 2.0,
                    },
                    PhaseDef {
                        hp_percent: 66.0,
                        attack_indices: vec![0, 1],
                        attack_duration: 4.0,
                        rest_duration: 1.5,
                    },
                    PhaseDef {
                        hp_percent: 33.0,
                        attack_indices: vec![1, 2],
                        attack_duration: 5.0,
                        rest_duration: 1.0,
                    },
                ],
                loot: vec![
                    LootEntry {
                        item: "cube_edge".to_string(),
                        chance: 0.25,
                    },
                    LootEntry {
                        item: "cube_carapace".to_string(),
                        chance: 0.25,
                    },
                    LootEntry {
                        item: "health_potion".to_string(),
                        chance: 0.9,
                    },
                ],
                opens_dungeon: None,
                is_boss: true,
            },
        );
    }

    fn register_dungeons(&mut self) {
        self.dungeons.insert(
            "cube_dungeon".to_string(),
            DungeonDef {
                id: "cube_dungeon".to_string(),
                name: "Dungeon of the Cube".to_string(),
                width: 140,
                height: 80,
                min_rooms: 12,
                max_rooms: 18,
                room_min: 8,
                room_max: 14,
                gap_min: 6,
                gap_max: 12,
                minion: "cube_minion".to_string(),
                guardian: "cube_guardian".to_string(),
                boss: "cube_overlord".to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exp_curve() {
        assert_eq!(exp_for_level(1), 100);
        assert_eq!(exp_for_level(2), 120);
        assert_eq!(exp_for_level(3), 144);
        // Monotonically increasing.
        let mut prev = 0;
        for level in 1..=20 {
            let need = exp_for_level(level);
            assert!(need > prev, "exp requirement must grow at level {}", level);
            prev = need;
        }
    }

    #[test]
    fn test_builtin_cross_references_resolve() {
        let c = ContentTables::builtin();
        for class in c.classes.values() {
            for slot in class.starting_equipment.iter().flatten() {
                assert!(c.items.contains_key(slot), "missing item {}", slot);
            }
        }
        for enemy in c.enemies.values() {
            for attack in &enemy.attacks {
                assert!(
                    c.projectiles.contains_key(&attack.projectile),
                    "missing projectile {} on {}",
                    attack.projectile,
                    enemy.id
                );
            }
            for entry in &enemy.loot {
                assert!(c.items.contains_key(&entry.item), "missing loot {}", entry.item);
            }
            if let Some((dungeon, _)) = &enemy.opens_dungeon {
                assert!(c.dungeons.contains_key(dungeon));
            }
        }
        for weapon_id in ["starter_staff", "starter_bow", "starter_sword"] {
            let w = c.item(weapon_id).unwrap().as_weapon().unwrap();
            assert!(c.projectiles.contains_key(&w.projectile));
        }
        for dungeon in c.dungeons.values() {
            assert!(c.enemies.contains_key(&dungeon.minion));
            assert!(c.enemies.contains_key(&dungeon.guardian));
            assert!(c.enemies[&dungeon.boss].is_boss);
        }
    }

    #[test]
    fn test_phases_are_descending_and_indexed() {
        let c = ContentTables::builtin();
        for enemy in c.enemies.values() {
            let mut prev = f32::INFINITY;
            for phase in &enemy.phases {
                assert!(phase.hp_percent < prev, "{} phases not descending", enemy.id);
                prev = phase.hp_percent;
                for &idx in &phase.attack_indices {
                    assert!(idx < enemy.attacks.len());
                }
                assert!(phase.attack_duration > 0.0);
                assert!(phase.rest_duration >= 0.0);
            }
        }
    }

    #[test]
    fn test_starter_staff_matches_combat_numbers() {
        let c = ContentTables::builtin();
        let staff = c.item("starter_staff").unwrap().as_weapon().unwrap();
        assert_eq!(staff.min_damage, 15);
        assert_eq!(staff.max_damage, 25);
        let pirate = c.enemy("pirate").unwrap();
        assert_eq!(pirate.max_hp, 100);
        assert_eq!(pirate.defense, 2);
        assert_eq!(pirate.xp, 20);
    }

    #[test]
    fn test_demon_opens_cube_dungeon() {
        let c = ContentTables::builtin();
        let demon = c.enemy("demon").unwrap();
        let (dungeon, chance) = demon.opens_dungeon.clone().unwrap();
        assert_eq!(dungeon, "cube_dungeon");
        assert!((chance - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_soulbound_items_exist_on_boss_table() {
        let c = ContentTables::builtin();
        let boss = c.enemy("cube_overlord").unwrap();
        let soulbound: Vec<_> = boss
            .loot
            .iter()
            .filter(|e| c.items[&e.item].soulbound)
            .collect();
        assert!(!soulbound.is_empty());
    }
}
