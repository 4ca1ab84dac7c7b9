//! Minimal command set used by the server binary
//!
//! No game rules live here; each action exercises one part of the session
//! interface (identity, groups, positions, direct and scoped delivery).

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::consumer::{CommandConsumer, Session};
use crate::hub::HubError;
use crate::net::protocol::{ChatScope, InboundMessage, OutboundMessage};
use crate::participant::{Correspondent, Identity};
use crate::util::vec2::Vec2;

/// Radius reached by `shout`
pub const SHOUT_RADIUS: f32 = 100.0;

const MAX_NAME_LEN: usize = 24;
const MAX_GROUP_LEN: usize = 32;

/// Reference [`CommandConsumer`]
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCommands;

/// Text argument of a message: `message` wins over `payload`
fn text(message: &InboundMessage) -> Option<&str> {
    message
        .message
        .as_deref()
        .or(message.payload.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Stable ids per name, so signing in twice with one name is a takeover
fn participant_for(name: &str) -> Identity {
    let key = name.to_ascii_lowercase();
    let participant = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
    let account = Uuid::new_v5(&participant, b"account");
    Identity::new(participant, account, name)
}

fn parse_position(raw: &str) -> Option<Vec2> {
    let mut parts = raw.split(|c: char| c == ',' || c.is_whitespace()).filter(|p| !p.is_empty());
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Vec2::new(x, y)).filter(Vec2::is_finite)
}

fn reply(session: &Session, message: OutboundMessage) {
    if let Err(e) = session.send(&message) {
        debug!(conn_id = session.client().id(), "reply dropped: {}", e);
    }
}

fn reply_error(session: &Session, code: &str, text: impl Into<String>) {
    reply(session, OutboundMessage::error(code, text));
}

fn hub_failure(session: &Session, e: HubError) {
    reply_error(session, "unavailable", e.to_string());
}

#[async_trait]
impl CommandConsumer for BasicCommands {
    async fn handle(&self, session: &Session, message: InboundMessage) {
        let action = message.action.to_ascii_lowercase();
        match action.as_str() {
            "login" => login(session, &message).await,
            "who" => who(session).await,
            "quit" => quit(session).await,
            _ if session.identity().is_none() => {
                reply_error(session, "not_logged_in", "log in first");
            }
            "join" => join(session, &message).await,
            "move" => move_to(session, &message).await,
            "say" => say(session, &message).await,
            "shout" => shout(session, &message).await,
            "tell" => tell(session, &message).await,
            "reply" => reply_to(session, &message).await,
            _ => reply_error(session, "unknown_action", format!("unknown action '{}'", message.action)),
        }
    }
}

async fn login(session: &Session, message: &InboundMessage) {
    let Some(name) = message.payload.as_deref().map(str::trim) else {
        return reply_error(session, "bad_request", "login needs a name");
    };
    if !valid_name(name) {
        return reply_error(session, "bad_request", "names are 1-24 letters, digits, '_' or '-'");
    }
    if session.identity().is_some() {
        return reply_error(session, "already_logged_in", "already logged in");
    }

    match session.identify(participant_for(name)).await {
        Ok(()) => reply(session, OutboundMessage::info(format!("welcome, {}", name))),
        Err(e) => hub_failure(session, e),
    }
}

async fn join(session: &Session, message: &InboundMessage) {
    let group = message
        .payload
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty() && g.len() <= MAX_GROUP_LEN)
        .map(str::to_string);

    if let Err(e) = session.join_group(group.clone()).await {
        return hub_failure(session, e);
    }

    let name = session.name().unwrap_or_default();
    match group {
        Some(group) => {
            let notice = OutboundMessage::info(format!("{} joined {}", name, group));
            let _ = session.broadcast_group(&notice, false).await;
            reply(session, OutboundMessage::info(format!("joined {}", group)));
        }
        None => reply(session, OutboundMessage::info("left group")),
    }
}

async fn move_to(session: &Session, message: &InboundMessage) {
    let Some(position) = message.payload.as_deref().and_then(parse_position) else {
        return reply_error(session, "bad_request", "move needs 'x y'");
    };
    match session.move_to(position).await {
        Ok(()) => reply(session, OutboundMessage::info(format!("now at {}", position))),
        Err(e) => hub_failure(session, e),
    }
}

async fn say(session: &Session, message: &InboundMessage) {
    let Some(line) = text(message) else {
        return reply_error(session, "bad_request", "say what?");
    };
    if session.group().is_none() {
        return reply_error(session, "no_group", "join a group first");
    }

    let name = session.name().unwrap_or_default();
    let chat = OutboundMessage::chat(ChatScope::Group, name, line);
    if let Err(e) = session.broadcast_group(&chat, true).await {
        hub_failure(session, e);
    }
}

async fn shout(session: &Session, message: &InboundMessage) {
    let Some(line) = text(message) else {
        return reply_error(session, "bad_request", "shout what?");
    };
    if session.position().is_none() {
        return reply_error(session, "no_position", "move somewhere first");
    }

    let name = session.name().unwrap_or_default();
    let chat = OutboundMessage::chat(ChatScope::Area, name, line);
    if let Err(e) = session.broadcast_nearby(SHOUT_RADIUS, &chat).await {
        hub_failure(session, e);
    }
}

async fn tell(session: &Session, message: &InboundMessage) {
    let (Some(target), Some(line)) = (message.target.as_deref(), text(message)) else {
        return reply_error(session, "bad_request", "tell needs a target and a message");
    };
    let Some(sender) = session.identity() else {
        return;
    };

    let recipient = match session.hub().lookup_by_name(target.trim()).await {
        Ok(Some(recipient)) => recipient,
        Ok(None) => return reply_error(session, "not_found", format!("{} is not here", target)),
        Err(e) => return hub_failure(session, e),
    };

    recipient.set_correspondent(Correspondent::from(&sender));
    let chat = OutboundMessage::chat(ChatScope::Direct, sender.name.clone(), line);
    match recipient.send_message(&chat) {
        Ok(()) => {
            if let Some(identity) = recipient.identity() {
                session.set_correspondent(Correspondent::from(&identity));
            }
            let to = recipient.name().unwrap_or_default();
            reply(session, OutboundMessage::info(format!("you tell {}: {}", to, line)));
        }
        Err(e) => reply_error(session, "not_delivered", e.to_string()),
    }
}

async fn reply_to(session: &Session, message: &InboundMessage) {
    let Some(line) = text(message) else {
        return reply_error(session, "bad_request", "reply with what?");
    };
    let Some(correspondent) = session.correspondent() else {
        return reply_error(session, "no_correspondent", "nobody to reply to");
    };
    let Some(sender) = session.identity() else {
        return;
    };

    let recipient = match session.hub().lookup_by_participant(correspondent.participant).await {
        Ok(Some(recipient)) => recipient,
        Ok(None) => {
            session.clear_correspondent();
            return reply_error(session, "not_found", format!("{} is gone", correspondent.name));
        }
        Err(e) => return hub_failure(session, e),
    };

    recipient.set_correspondent(Correspondent::from(&sender));
    let chat = OutboundMessage::chat(ChatScope::Direct, sender.name, line);
    if let Err(e) = recipient.send_message(&chat) {
        reply_error(session, "not_delivered", e.to_string());
    }
}

async fn who(session: &Session) {
    let group = session.group();
    let members = match &group {
        Some(group) => session.hub().lookup_by_group(group).await,
        None => session.hub().lookup_all().await,
    };

    match members {
        Ok(members) => {
            let mut names: Vec<String> = members.iter().filter_map(|c| c.name()).collect();
            names.sort_unstable();
            reply(
                session,
                OutboundMessage::State(serde_json::json!({
                    "group": group,
                    "online": members.len(),
                    "participants": names,
                })),
            );
        }
        Err(e) => hub_failure(session, e),
    }
}

async fn quit(session: &Session) {
    reply(session, OutboundMessage::info("goodbye"));
    if let Err(e) = session.disconnect().await {
        debug!(conn_id = session.client().id(), "quit: {}", e);
        session.client().close();
    }
}
