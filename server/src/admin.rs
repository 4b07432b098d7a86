//! Admin allowlist and chat command parsing.
//!
//! The allowlist is a line-delimited text file of usernames, matched
//! case-insensitively. A filesystem watcher reloads it on change by
//! publishing a fresh immutable snapshot; readers only ever swap whole
//! sets, never mutate one.
//!
//! Chat lines starting with `/` from allowlisted users parse into
//! [`AdminCommand`]s. Anything unrecognized falls through to normal chat,
//! and non-admin senders never reach the parser at all.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{info, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Give { item: String },
    Items { filter: Option<String> },
    Heal,
    Level { level: u32 },
    Spawn { enemy: String },
    Teleport { x: f32, y: f32 },
    Help,
}

impl AdminCommand {
    /// Parses a chat line that begins with `/`. `None` means the line is
    /// not a recognized command and should broadcast as chat.
    pub fn parse(line: &str) -> Option<AdminCommand> {
        let rest = line.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let verb = parts.next()?;
        match verb {
            "give" => parts.next().map(|item| AdminCommand::Give {
                item: item.to_string(),
            }),
            "items" => Some(AdminCommand::Items {
                filter: parts.next().map(|s| s.to_string()),
            }),
            "heal" => Some(AdminCommand::Heal),
            "level" => parts
                .next()
                .and_then(|n| n.parse().ok())
                .map(|level| AdminCommand::Level { level }),
            "spawn" => parts.next().map(|enemy| AdminCommand::Spawn {
                enemy: enemy.to_string(),
            }),
            "tp" => {
                let x = parts.next()?.parse().ok()?;
                let y = parts.next()?.parse().ok()?;
                Some(AdminCommand::Teleport { x, y })
            }
            "help" => Some(AdminCommand::Help),
            _ => None,
        }
    }

    pub const HELP_TEXT: &'static str =
        "/give <itemId> | /items [filter] | /heal | /level <n> | /spawn <enemyId> | /tp <x> <y> | /help";
}

/// The live allowlist. Cheap to clone; clones share the snapshot slot.
#[derive(Clone)]
pub struct AdminList {
    path: PathBuf,
    names: Arc<RwLock<Arc<HashSet<String>>>>,
}

impl AdminList {
    /// Loads the file (a missing file just means no admins).
    pub fn load(path: &Path) -> AdminList {
        let list = AdminList {
            path: path.to_path_buf(),
            names: Arc::new(RwLock::new(Arc::new(HashSet::new()))),
        };
        list.reload();
        list
    }

    pub fn is_admin(&self, username: &str) -> bool {
        let snapshot = self.names.read().expect("allowlist lock").clone();
        snapshot.contains(&username.to_lowercase())
    }

    /// Re-reads the file and swaps in a new snapshot.
    pub fn reload(&self) {
        let names: HashSet<String> = match std::fs::read_to_string(&self.path) {
            Ok(text) => text
                .lines()
                .map(|line| line.trim().to_lowercase())
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect(),
            Err(e) => {
                warn!("admin allowlist {} unreadable: {}", self.path.display(), e);
                HashSet::new()
            }
        };
        info!("admin allowlist: {} entries", names.len());
        *self.names.write().expect("allowlist lock") = Arc::new(names);
    }

    /// Starts watching the allowlist file for live updates. The returned
    /// watcher must be kept alive for as long as reloads should happen.
    pub fn watch(&self) -> notify::Result<RecommendedWatcher> {
        let list = self.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    list.reload();
                }
                Ok(_) => {}
                Err(e) => warn!("allowlist watch error: {}", e),
            })?;
        // Watch the parent directory: editors often replace the file.
        let target = self.path.parent().unwrap_or(Path::new("."));
        watcher.watch(target, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}
