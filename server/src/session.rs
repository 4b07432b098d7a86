//! The connection and session layer.
//!
//! Each accepted WebSocket gets two tasks: a writer draining an unbounded
//! channel into the socket, and a reader that decodes frames, enforces the
//! rate limits, answers authentication traffic directly against the store,
//! and forwards everything gameplay-related to the game loop as
//! [`GameCommand`]s tagged with the connection id.
//!
//! Malformed frames, unknown message types and prototype-pollution shapes
//! are dropped silently (logged at debug); the connection stays open.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use realm_shared::protocol::{
    self, CharacterSummary, ClientMessage, ServerMessage,
};
use realm_shared::{
    Vec2, AUTH_ATTEMPT_LIMIT, AUTH_ATTEMPT_WINDOW_SECS, CHAT_MAX_LEN, INPUT_BURST_LIMIT,
    INPUT_BURST_WINDOW_MS,
};

use crate::content::ContentTables;
use crate::persistence::Store;

/// Connection id, unique for the life of the process.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Writer handle for pushing outbound messages to one connection.
pub type SessionHandle = mpsc::UnboundedSender<Message>;

/// Commands the session layer forwards into the game loop.
#[derive(Debug)]
pub enum GameCommand {
    Attach {
        conn: ConnId,
        reply: SessionHandle,
        account_id: Uuid,
        username: String,
        character_id: Uuid,
    },
    Detach {
        conn: ConnId,
    },
    Input {
        conn: ConnId,
        move_dir: Vec2,
        aim: f32,
        shooting: bool,
    },
    Shoot {
        conn: ConnId,
        aim: f32,
    },
    UseAbility {
        conn: ConnId,
    },
    PickupLoot {
        conn: ConnId,
        loot: Uuid,
    },
    EnterPortal {
        conn: ConnId,
        portal: Uuid,
    },
    ReturnToNexus {
        conn: ConnId,
    },
    Chat {
        conn: ConnId,
        message: String,
    },
    SwapItems {
        conn: ConnId,
        from: u8,
        to: u8,
    },
    DropItem {
        conn: ConnId,
        slot: u8,
    },
    InteractVaultChest {
        conn: ConnId,
    },
    VaultTransfer {
        conn: ConnId,
        from_vault: bool,
        from_slot: u8,
        to_slot: u8,
    },
    CloseVault {
        conn: ConnId,
    },
}

/// Everything a connection task needs, shared across all connections.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<Mutex<Store>>,
    pub content: Arc<ContentTables>,
    pub commands: mpsc::UnboundedSender<GameCommand>,
    /// Allowed `Origin` values; an absent header is always accepted.
    pub allowed_origins: Arc<Vec<String>>,
    pub connections: Arc<AtomicUsize>,
    pub max_clients: usize,
}

/// Inbound flood control: messages closer together than the burst window
/// grow a burst counter; past the limit the message is dropped.
#[derive(Debug, Default)]
pub struct BurstLimiter {
    last: Option<Instant>,
    burst: u32,
}

impl BurstLimiter {
    /// True when the message may be processed.
    pub fn allow(&mut self, now: Instant) -> bool {
        let allowed = match self.last {
            Some(last) if now.duration_since(last) < Duration::from_millis(INPUT_BURST_WINDOW_MS) => {
                self.burst += 1;
                self.burst <= INPUT_BURST_LIMIT
            }
            _ => {
                self.burst = 0;
                true
            }
        };
        self.last = Some(now);
        allowed
    }
}

/// Auth attempt control: a fixed number of tries per rolling window.
#[derive(Debug)]
pub struct AuthLimiter {
    window_start: Instant,
    attempts: u32,
}

impl Default for AuthLimiter {
    fn default() -> Self {
        AuthLimiter {
            window_start: Instant::now(),
            attempts: 0,
        }
    }
}

impl AuthLimiter {
    pub fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(AUTH_ATTEMPT_WINDOW_SECS) {
            self.window_start = now;
            self.attempts = 0;
        }
        self.attempts += 1;
        self.attempts <= AUTH_ATTEMPT_LIMIT
    }
}

/// Escapes the characters with markup meaning so chat can be rendered
/// verbatim in an HTML client.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Clamps a client move vector. Small overshoots (up to 1.1) renormalize to
/// unit length; anything longer or non-finite is rejected.
pub fn sanitize_move_dir(dir: Vec2) -> Option<Vec2> {
    if !dir.x.is_finite() || !dir.y.is_finite() {
        return None;
    }
    let mag = dir.length();
    if mag > 1.1 {
        return None;
    }
    if mag > 1.0 {
        return Some(dir.normalize());
    }
    Some(dir)
}

struct Conn {
    id: ConnId,
    reply: SessionHandle,
    account: Option<(Uuid, String)>,
    attached: bool,
    input_limiter: BurstLimiter,
    auth_limiter: AuthLimiter,
}

impl Conn {
    fn send(&self, msg: &ServerMessage) {
        let _ = self.reply.send(Message::Binary(protocol::encode(msg)));
    }

    fn send_error(&self, message: &str) {
        self.send(&ServerMessage::Error {
            message: message.to_string(),
        });
    }
}

/// Accepts the WebSocket handshake (checking `Origin`) and runs the
/// connection until it closes.
pub async fn handle_connection(stream: TcpStream, deps: SessionDeps) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let origins = deps.allowed_origins.clone();
    let check_origin = move |req: &Request, response: Response| {
        match req.headers().get("Origin").and_then(|v| v.to_str().ok()) {
            None => Ok(response),
            Some(origin) if origins.iter().any(|o| o == origin) => Ok(response),
            Some(origin) => {
                warn!("rejected origin {:?}", origin);
                let mut response = ErrorResponse::new(Some("forbidden origin".to_string()));
                *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                Err(response)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_origin).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("handshake with {} failed: {}", peer, e);
            return;
        }
    };

    if deps.connections.fetch_add(1, Ordering::SeqCst) >= deps.max_clients {
        deps.connections.fetch_sub(1, Ordering::SeqCst);
        warn!("connection from {} rejected: server full", peer);
        let (mut sink, _) = ws.split();
        let full = ServerMessage::Error {
            message: "Server full".to_string(),
        };
        let _ = sink.send(Message::Binary(protocol::encode(&full))).await;
        let _ = sink.close().await;
        return;
    }

    let (mut sink, mut source) = ws.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the only place that touches the sink.
    tokio::spawn(async move {
        while let Some(msg) = reply_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Conn {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst),
        reply: reply_tx,
        account: None,
        attached: false,
        input_limiter: BurstLimiter::default(),
        auth_limiter: AuthLimiter::default(),
    };
    info!("connection {} open from {}", conn.id, peer);

    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("connection {} socket error: {}", conn.id, e);
                break;
            }
        };
        if !conn.input_limiter.allow(Instant::now()) {
            conn.send_error("rate-limited");
            continue;
        }
        let decoded = match &frame {
            Message::Binary(bytes) => protocol::decode(bytes),
            Message::Text(text) => protocol::decode_json(text),
            Message::Close(_) => break,
            _ => continue,
        };
        match decoded {
            Ok(msg) => handle_message(&mut conn, msg, &deps),
            Err(e) => {
                // Protocol violation: drop silently, keep the connection.
                debug!("connection {} dropped frame: {}", conn.id, e);
            }
        }
    }

    info!("connection {} closed", conn.id);
    let _ = deps.commands.send(GameCommand::Detach { conn: conn.id });
    deps.connections.fetch_sub(1, Ordering::SeqCst);
}

fn handle_message(conn: &mut Conn, msg: ClientMessage, deps: &SessionDeps) {
    match msg {
        ClientMessage::Auth { user, pass } => {
            if !conn.auth_limiter.allow(Instant::now()) {
                conn.send_error("Too many attempts");
                return;
            }
            let store = deps.store.lock().expect("store lock");
            match store.validate_login(&user, &pass).map(|a| (a.id, a.username.clone())) {
                Some((account_id, username)) => {
                    drop(store);
                    let token = deps
                        .store
                        .lock()
                        .expect("store lock")
                        .create_session(account_id)
                        .ok();
                    conn.account = Some((account_id, username));
                    conn.send(&ServerMessage::AuthResult {
                        success: true,
                        token,
                        message: "ok".to_string(),
                    });
                    send_character_list(conn, deps, account_id);
                }
                None => {
                    conn.send(&ServerMessage::AuthResult {
                        success: false,
                        token: None,
                        message: "Invalid username or password".to_string(),
                    });
                }
            }
        }
        ClientMessage::AuthToken { token } => {
            if !conn.auth_limiter.allow(Instant::now()) {
                conn.send_error("Too many attempts");
                return;
            }
            let store = deps.store.lock().expect("store lock");
            match store
                .validate_session(&token)
                .map(|a| (a.id, a.username.clone()))
            {
                Some((account_id, username)) => {
                    drop(store);
                    conn.account = Some((account_id, username));
                    conn.send(&ServerMessage::AuthResult {
                        success: true,
                        token: Some(token),
                        message: "ok".to_string(),
                    });
                    send_character_list(conn, deps, account_id);
                }
                None => {
                    conn.send(&ServerMessage::AuthResult {
                        success: false,
                        token: None,
                        message: "Invalid username or password".to_string(),
                    });
                }
            }
        }
        ClientMessage::Logout { token } => {
            if let Err(e) = deps.store.lock().expect("store lock").revoke_session(&token) {
                warn!("revoking session failed: {}", e);
            }
            conn.account = None;
            conn.attached = false;
            let _ = deps.commands.send(GameCommand::Detach { conn: conn.id });
        }
        ClientMessage::Register { user, pass } => {
            if !conn.auth_limiter.allow(Instant::now()) {
                conn.send_error("Too many attempts");
                return;
            }
            if user.trim().is_empty() || user.len() > 24 || pass.is_empty() {
                conn.send(&ServerMessage::RegisterResult {
                    success: false,
                    message: "Registration failed".to_string(),
                });
                return;
            }
            let result = deps
                .store
                .lock()
                .expect("store lock")
                .create_account(&user, &pass);
            match result {
                Ok(_) => conn.send(&ServerMessage::RegisterResult {
                    success: true,
                    message: "ok".to_string(),
                }),
                // One generic failure message whether the name was taken or
                // anything else went wrong; no account enumeration.
                Err(_) => {
                    conn.send(&ServerMessage::RegisterResult {
                        success: false,
                        message: "Registration failed".to_string(),
                    });
                }
            }
        }
        ClientMessage::CreateCharacter { class_id } => {
            let (account_id, _) = match conn.account {
                Some(ref acc) => acc.clone(),
                None => return,
            };
            let class = match deps.content.class(&class_id) {
                Some(class) => class.clone(),
                None => {
                    conn.send_error("Unknown class");
                    return;
                }
            };
            let result = deps.store.lock().expect("store lock").create_character(
                account_id,
                &class_id,
                class.base_stats,
                class.base_hp,
                class.base_mp,
                class.starting_equipment.clone(),
            );
            if let Err(e) = result {
                debug!("createCharacter failed: {}", e);
            }
            send_character_list(conn, deps, account_id);
        }
        ClientMessage::SelectCharacter { character_id } => {
            let (account_id, username) = match conn.account {
                Some(ref acc) => acc.clone(),
                None => return,
            };
            let valid = {
                let store = deps.store.lock().expect("store lock");
                store
                    .get_character(character_id)
                    .map(|c| c.account_id == account_id && c.alive)
                    .unwrap_or(false)
            };
            if !valid {
                // Do not reveal whether the character exists.
                return;
            }
            conn.attached = true;
            let _ = deps.commands.send(GameCommand::Attach {
                conn: conn.id,
                reply: conn.reply.clone(),
                account_id,
                username,
                character_id,
            });
        }
        ClientMessage::Input {
            move_direction,
            aim_angle,
            shooting,
        } => {
            if !conn.attached || !aim_angle.is_finite() {
                return;
            }
            let move_dir = match sanitize_move_dir(move_direction) {
                Some(dir) => dir,
                None => return,
            };
            let _ = deps.commands.send(GameCommand::Input {
                conn: conn.id,
                move_dir,
                aim: aim_angle,
                shooting,
            });
        }
        ClientMessage::Shoot { aim_angle } => {
            if !conn.attached || !aim_angle.is_finite() {
                return;
            }
            let _ = deps.commands.send(GameCommand::Shoot {
                conn: conn.id,
                aim: aim_angle,
            });
        }
        ClientMessage::UseAbility => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::UseAbility { conn: conn.id });
            }
        }
        ClientMessage::PickupLoot { loot_id } => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::PickupLoot {
                    conn: conn.id,
                    loot: loot_id,
                });
            }
        }
        ClientMessage::EnterPortal { portal_id } => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::EnterPortal {
                    conn: conn.id,
                    portal: portal_id,
                });
            }
        }
        ClientMessage::ReturnToNexus => {
            if conn.attached {
                let _ = deps
                    .commands
                    .send(GameCommand::ReturnToNexus { conn: conn.id });
            }
        }
        ClientMessage::Chat { message } => {
            if !conn.attached {
                return;
            }
            let trimmed = message.trim();
            if trimmed.is_empty() || trimmed.chars().count() > CHAT_MAX_LEN {
                return;
            }
            let _ = deps.commands.send(GameCommand::Chat {
                conn: conn.id,
                message: html_escape(trimmed),
            });
        }
        ClientMessage::SwapItems { from, to } => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::SwapItems {
                    conn: conn.id,
                    from,
                    to,
                });
            }
        }
        ClientMessage::DropItem { slot } => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::DropItem {
                    conn: conn.id,
                    slot,
                });
            }
        }
        ClientMessage::InteractVaultChest => {
            if conn.attached {
                let _ = deps
                    .commands
                    .send(GameCommand::InteractVaultChest { conn: conn.id });
            }
        }
        ClientMessage::VaultTransfer {
            from_vault,
            from_slot,
            to_slot,
        } => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::VaultTransfer {
                    conn: conn.id,
                    from_vault,
                    from_slot,
                    to_slot,
                });
            }
        }
        ClientMessage::CloseVault => {
            if conn.attached {
                let _ = deps.commands.send(GameCommand::CloseVault { conn: conn.id });
            }
        }
    }
}

fn send_character_list(conn: &Conn, deps: &SessionDeps, account_id: Uuid) {
    let characters: Vec<CharacterSummary> = {
        let store = deps.store.lock().expect("store lock");
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
    conn.send(&ServerMessage::CharacterList { characters });
}
