//! The opaque persistence store: accounts, sessions, characters and vaults.
//!
//! A single JSON document at `DB_PATH`, loaded at startup and flushed with a
//! write-to-temp-then-rename so a crash mid-save never corrupts the file.
//! All access goes through one handle behind a mutex; the store itself is
//! the lock boundary.
//!
//! Passwords are bcrypt-hashed. `validate_login` verifies against a dummy
//! hash when the username is unknown so the two failure paths take the same
//! time. Session tokens are 32 bytes of OS randomness, hex-encoded, with a
//! 30-day lifetime; expired rows are swept whenever a new session is minted.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use realm_shared::{
    EQUIP_SLOTS, INVENTORY_SIZE, MAX_ALIVE_PER_CLASS, SESSION_LIFETIME_SECS, VAULT_SIZE,
};

use crate::entity::player::{LifetimeCounters, StatBlock};

/// Verified against when the username does not exist, so lookups are
/// constant-time with respect to account existence. This is `bcrypt("…")`
/// of an unguessable throwaway string.
const DUMMY_HASH: &str = "$2b$12$QGQX6Ig7sQSpawn0fY2u0eC7nJ9yX0mZpJ1hQ0iFglxkZfG3m8dIW";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("username already taken")]
    UsernameTaken,
    #[error("hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("no such account")]
    NoSuchAccount,
    #[error("class roster full")]
    RosterFull,
    #[error("no such character")]
    NoSuchCharacter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    password_hash: String,
    pub vault: Vec<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub account_id: Uuid,
    pub expires_at_ms: u64,
}

/// The durable character record. The live [`crate::entity::player::Player`]
/// is rebuilt from this on login and folded back on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub class_id: String,
    pub level: u32,
    pub exp: i64,
    pub hp: i32,
    pub mp: i32,
    pub stats: StatBlock,
    pub equipment: [Option<String>; EQUIP_SLOTS],
    pub inventory: [Option<String>; INVENTORY_SIZE],
    pub counters: LifetimeCounters,
    pub alive: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    accounts: HashMap<Uuid, Account>,
    sessions: HashMap<String, SessionRow>,
    characters: HashMap<Uuid, Character>,
}

pub struct Store {
    path: PathBuf,
    data: StoreData,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hex_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

impl Store {
    /// Opens or creates the store file.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let data = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("creating new store at {}", path.display());
                StoreData::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Store {
            path: path.to_path_buf(),
            data,
        })
    }

    /// Writes the whole document atomically.
    pub fn flush(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // === Accounts ===

    pub fn get_account(&self, id: Uuid) -> Option<&Account> {
        self.data.accounts.get(&id)
    }

    pub fn create_account(&mut self, username: &str, password: &str) -> Result<Uuid, StoreError> {
        let key = username.to_lowercase();
        if self
            .data
            .accounts
            .values()
            .any(|a| a.username.to_lowercase() == key)
        {
            return Err(StoreError::UsernameTaken);
        }
        let id = Uuid::new_v4();
        let account = Account {
            id,
            username: username.to_string(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
            vault: vec![None; VAULT_SIZE],
        };
        self.data.accounts.insert(id, account);
        self.flush()?;
        Ok(id)
    }

    /// Returns the account on success, `None` on any credential failure.
    /// The password check runs whether or not the user exists.
    pub fn validate_login(&self, username: &str, password: &str) -> Option<&Account> {
        let key = username.to_lowercase();
        let account = self
            .data
            .accounts
            .values()
            .find(|a| a.username.to_lowercase() == key);
        let hash = account.map(|a| a.password_hash.as_str()).unwrap_or(DUMMY_HASH);
        match bcrypt::verify(password, hash) {
            Ok(true) => account,
            Ok(false) => None,
            Err(e) => {
                warn!("bcrypt verify failed: {}", e);
                None
            }
        }
    }

    // === Sessions ===

    /// Mints a token; sweeps every expired session first.
    pub fn create_session(&mut self, account_id: Uuid) -> Result<String, StoreError> {
        if !self.data.accounts.contains_key(&account_id) {
            return Err(StoreError::NoSuchAccount);
        }
        let now = now_ms();
        self.data.sessions.retain(|_, row| row.expires_at_ms > now);
        let token = hex_token();
        self.data.sessions.insert(
            token.clone(),
            SessionRow {
                account_id,
                expires_at_ms: now + SESSION_LIFETIME_SECS * 1000,
            },
        );
        self.flush()?;
        Ok(token)
    }

    pub fn validate_session(&self, token: &str) -> Option<&Account> {
        let row = self.data.sessions.get(token)?;
        if row.expires_at_ms <= now_ms() {
            return None;
        }
        self.data.accounts.get(&row.account_id)
    }

    pub fn revoke_session(&mut self, token: &str) -> Result<(), StoreError> {
        if self.data.sessions.remove(token).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    // === Characters ===

    /// Creates an alive character named after the account, enforcing the
    /// per-class roster cap.
    pub fn create_character(
        &mut self,
        account_id: Uuid,
        class_id: &str,
        stats: StatBlock,
        hp: i32,
        mp: i32,
        equipment: [Option<String>; EQUIP_SLOTS],
    ) -> Result<Uuid, StoreError> {
        let account = self
            .data
            .accounts
            .get(&account_id)
            .ok_or(StoreError::NoSuchAccount)?;
        let alive_of_class = self
            .data
            .characters
            .values()
            .filter(|c| c.account_id == account_id && c.alive && c.class_id == class_id)
            .count();
        if alive_of_class >= MAX_ALIVE_PER_CLASS {
            return Err(StoreError::RosterFull);
        }
        let id = Uuid::new_v4();
        let character = Character {
            id,
            account_id,
            name: account.username.clone(),
            class_id: class_id.to_string(),
            level: 1,
            exp: 0,
            hp,
            mp,
            stats,
            equipment,
            inventory: Default::default(),
            counters: Default::default(),
            alive: true,
        };
        self.data.characters.insert(id, character);
        self.flush()?;
        Ok(id)
    }

    pub fn get_character(&self, id: Uuid) -> Option<&Character> {
        self.data.characters.get(&id)
    }

    pub fn alive_characters(&self, account_id: Uuid) -> Vec<&Character> {
        let mut list: Vec<&Character> = self
            .data
            .characters
            .values()
            .filter(|c| c.account_id == account_id && c.alive)
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub fn save_character(&mut self, character: Character) -> Result<(), StoreError> {
        if !self.data.characters.contains_key(&character.id) {
            return Err(StoreError::NoSuchCharacter);
        }
        self.data.characters.insert(character.id, character);
        self.flush()?;
        Ok(())
    }

    /// Permadeath: flips the alive flag; the record stays for the graveyard.
    pub fn kill_character(&mut self, id: Uuid) -> Result<(), StoreError> {
        let character = self
            .data
            .characters
            .get_mut(&id)
            .ok_or(StoreError::NoSuchCharacter)?;
        character.alive = false;
        self.flush()?;
        Ok(())
    }

    // === Vaults ===

    pub fn get_vault_items(&self, account_id: Uuid) -> Vec<Option<String>> {
        self.data
            .accounts
            .get(&account_id)
            .map(|a| {
                let mut vault = a.vault.clone();
                vault.resize(VAULT_SIZE, None);
                vault
            })
            .unwrap_or_else(|| vec![None; VAULT_SIZE])
    }

    pub fn save_vault_items(
        &mut self,
        account_id: Uuid,
        items: Vec<Option<String>>,
    ) -> Result<(), StoreError> {
        let account = self
            .data
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::NoSuchAccount)?;
        let mut items = items;
        items.resize(VAULT_SIZE, None);
        account.vault = items;
        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_account_roundtrip_and_duplicate_rejection() {
        let (_dir, mut store) = store();
        let id = store.create_account("Alice", "secret").unwrap();
        assert_eq!(store.get_account(id).unwrap().username, "Alice");
        // Case-insensitive uniqueness.
        assert!(matches!(
            store.create_account("alice", "other"),
            Err(StoreError::UsernameTaken)
        ));
    }

    #[test]
    fn test_login_validation() {
        let (_dir, mut store) = store();
        store.create_account("bob", "hunter2").unwrap();
        assert!(store.validate_login("bob", "hunter2").is_some());
        assert!(store.validate_login("bob", "wrong").is_none());
        // Unknown user takes the same code path and fails the same way.
        assert!(store.validate_login("nobody", "hunter2").is_none());
    }

    #[test]
    fn test_sessions_lifecycle() {
        let (_dir, mut store) = store();
        let account = store.create_account("carol", "pw").unwrap();
        let token = store.create_session(account).unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(store.validate_session(&token).unwrap().id, account);
        store.revoke_session(&token).unwrap();
        assert!(store.validate_session(&token).is_none());
    }

    #[test]
    fn test_expired_sessions_are_swept() {
        let (_dir, mut store) = store();
        let account = store.create_account("dave", "pw").unwrap();
        let stale = store.create_session(account).unwrap();
        store.data.sessions.get_mut(&stale).unwrap().expires_at_ms = 1;
        assert!(store.validate_session(&stale).is_none());
        // Minting a new session removes the expired row entirely.
        let _fresh = store.create_session(account).unwrap();
        assert!(!store.data.sessions.contains_key(&stale));
    }

    #[test]
    fn test_character_roster_cap_per_class() {
        let (_dir, mut store) = store();
        let account = store.create_account("erin", "pw").unwrap();
        let make = |store: &mut Store, class: &str| {
            store.create_character(
                account,
                class,
                StatBlock::default(),
                100,
                100,
                Default::default(),
            )
        };
        let a = make(&mut store, "wizard").unwrap();
        let _b = make(&mut store, "wizard").unwrap();
        assert!(matches!(
            make(&mut store, "wizard"),
            Err(StoreError::RosterFull)
        ));
        // A different class still has room.
        assert!(make(&mut store, "archer").is_ok());
        // Killing one frees a slot.
        store.kill_character(a).unwrap();
        assert!(make(&mut store, "wizard").is_ok());
    }

    #[test]
    fn test_character_name_is_account_username() {
        let (_dir, mut store) = store();
        let account = store.create_account("Frank", "pw").unwrap();
        let id = store
            .create_character(
                account,
                "knight",
                StatBlock::default(),
                160,
                60,
                Default::default(),
            )
            .unwrap();
        assert_eq!(store.get_character(id).unwrap().name, "Frank");
    }

    #[test]
    fn test_vault_roundtrip() {
        let (_dir, mut store) = store();
        let account = store.create_account("grace", "pw").unwrap();
        let mut items = vec![None; VAULT_SIZE];
        items[0] = Some("cube_edge".to_string());
        items[7] = Some("health_potion".to_string());
        store.save_vault_items(account, items.clone()).unwrap();
        assert_eq!(store.get_vault_items(account), items);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        let account;
        let character;
        {
            let mut store = Store::open(&path).unwrap();
            account = store.create_account("heidi", "pw").unwrap();
            character = store
                .create_character(
                    account,
                    "wizard",
                    StatBlock::default(),
                    100,
                    100,
                    Default::default(),
                )
                .unwrap();
            let mut c = store.get_character(character).unwrap().clone();
            c.level = 7;
            store.save_character(c).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_account(account).unwrap().username, "heidi");
        assert_eq!(store.get_character(character).unwrap().level, 7);
    }
}
