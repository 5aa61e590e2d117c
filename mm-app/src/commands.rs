//! Chat command parser and dispatcher for the operator channel.

use crate::config::{spawn_persist, validate_forwarding_entry};
use crate::runtime::AppContext;
use mm_transport::{ConversationId, MessageId};
use std::sync::atomic::Ordering;

// Not Eq: AgentDelay carries f64 bounds.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Pause,
    Resume,
    Status,
    ListenAdd { source: String, destination: String },
    ListenRemove { source: String },
    ListenList,
    AgentOn,
    AgentOff,
    AgentEnroll { conversation: String },
    AgentUnenroll { conversation: String },
    AgentProbability(u8),
    AgentCooldown(u64),
    AgentDelay { min: f64, max: f64 },
    AgentMinUsers(usize),
    AgentWindow(i64),
    AgentResume { conversation: String },
    AlertOn,
    AlertOff,
    AlertAdd(String),
    AlertRemove(String),
    AlertList,
    ManualOn,
    ManualOff,
    ManualSend { conversation: String, text: String },
    ManualReply {
        conversation: String,
        message_id: String,
        text: String,
    },
    PeerAdd(String),
    PeerRemove(String),
    PeerList,
}

#[derive(Debug, PartialEq)]
pub enum Parsed {
    Command(Command),
    Usage(String),
}

const HELP_TEXT: &str = "\
Commands:
/pause | /resume | /status
/listen add <source> <@dest|id> | /listen remove <source> | /listen list
/agent on|off | /agent enroll <conv> | /agent unenroll <conv>
/agent prob <0-100> | /agent cooldown <secs> | /agent delay <min> <max>
/agent minusers <n> | /agent window <minutes> | /agent resume <conv>
/alert on|off | /alert add <keyword> | /alert remove <keyword> | /alert list
/manual on|off | /manual send <conv> <text> | /manual reply <conv> <msg_id> <text>
/peer add <id> | /peer remove <id> | /peer list";

/// Returns None for anything that is not a slash command.
pub fn parse(input: &str) -> Option<Parsed> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    let head = parts[0].to_ascii_lowercase();

    let parsed = match head.as_str() {
        "/help" => Parsed::Command(Command::Help),
        "/pause" => Parsed::Command(Command::Pause),
        "/resume" => Parsed::Command(Command::Resume),
        "/status" => Parsed::Command(Command::Status),
        "/listen" => parse_listen(&parts[1..]),
        "/agent" => parse_agent(&parts[1..]),
        "/alert" => parse_alert(&parts[1..]),
        "/manual" => parse_manual(&parts[1..]),
        "/peer" => parse_peer(&parts[1..]),
        _ => Parsed::Usage(format!("Unknown command {head}. Try /help.")),
    };
    Some(parsed)
}

fn parse_listen(args: &[&str]) -> Parsed {
    match args {
        ["add", source, destination] => Parsed::Command(Command::ListenAdd {
            source: source.to_string(),
            destination: destination.to_string(),
        }),
        ["remove", source] => Parsed::Command(Command::ListenRemove {
            source: source.to_string(),
        }),
        ["list"] => Parsed::Command(Command::ListenList),
        _ => Parsed::Usage(
            "Usage: /listen add <source> <@dest|id> | /listen remove <source> | /listen list"
                .to_string(),
        ),
    }
}

fn parse_agent(args: &[&str]) -> Parsed {
    let usage = || {
        Parsed::Usage(
            "Usage: /agent on|off | enroll <conv> | unenroll <conv> | prob <0-100> | \
             cooldown <secs> | delay <min> <max> | minusers <n> | window <minutes> | \
             resume <conv>"
                .to_string(),
        )
    };
    match args {
        ["on"] => Parsed::Command(Command::AgentOn),
        ["off"] => Parsed::Command(Command::AgentOff),
        ["enroll", conv] => Parsed::Command(Command::AgentEnroll {
            conversation: conv.to_string(),
        }),
        ["unenroll", conv] => Parsed::Command(Command::AgentUnenroll {
            conversation: conv.to_string(),
        }),
        ["prob", value] => match value.parse::<u8>() {
            Ok(p) if p <= 100 => Parsed::Command(Command::AgentProbability(p)),
            _ => Parsed::Usage("Usage: /agent prob <0-100>".to_string()),
        },
        ["cooldown", value] => match value.parse::<u64>() {
            Ok(secs) => Parsed::Command(Command::AgentCooldown(secs)),
            Err(_) => Parsed::Usage("Usage: /agent cooldown <secs>".to_string()),
        },
        ["delay", min, max] => match (min.parse::<f64>(), max.parse::<f64>()) {
            (Ok(min), Ok(max)) if min >= 0.0 && max >= min => {
                Parsed::Command(Command::AgentDelay { min, max })
            }
            _ => Parsed::Usage("Usage: /agent delay <min_secs> <max_secs>".to_string()),
        },
        ["minusers", value] => match value.parse::<usize>() {
            Ok(n) => Parsed::Command(Command::AgentMinUsers(n)),
            Err(_) => Parsed::Usage("Usage: /agent minusers <n>".to_string()),
        },
        ["window", value] => match value.parse::<i64>() {
            Ok(minutes) if minutes > 0 => Parsed::Command(Command::AgentWindow(minutes)),
            _ => Parsed::Usage("Usage: /agent window <minutes>".to_string()),
        },
        ["resume", conv] => Parsed::Command(Command::AgentResume {
            conversation: conv.to_string(),
        }),
        _ => usage(),
    }
}

fn parse_alert(args: &[&str]) -> Parsed {
    match args {
        ["on"] => Parsed::Command(Command::AlertOn),
        ["off"] => Parsed::Command(Command::AlertOff),
        ["add", keyword] => Parsed::Command(Command::AlertAdd(keyword.to_lowercase())),
        ["remove", keyword] => Parsed::Command(Command::AlertRemove(keyword.to_lowercase())),
        ["list"] => Parsed::Command(Command::AlertList),
        _ => Parsed::Usage(
            "Usage: /alert on|off | /alert add <keyword> | /alert remove <keyword> | /alert list"
                .to_string(),
        ),
    }
}

fn parse_manual(args: &[&str]) -> Parsed {
    match args {
        ["on"] => Parsed::Command(Command::ManualOn),
        ["off"] => Parsed::Command(Command::ManualOff),
        ["send", conv, rest @ ..] if !rest.is_empty() => Parsed::Command(Command::ManualSend {
            conversation: conv.to_string(),
            text: rest.join(" "),
        }),
        ["reply", conv, message_id, rest @ ..] if !rest.is_empty() => {
            Parsed::Command(Command::ManualReply {
                conversation: conv.to_string(),
                message_id: message_id.to_string(),
                text: rest.join(" "),
            })
        }
        _ => Parsed::Usage(
            "Usage: /manual on|off | /manual send <conv> <text> | \
             /manual reply <conv> <msg_id> <text>"
                .to_string(),
        ),
    }
}

fn parse_peer(args: &[&str]) -> Parsed {
    match args {
        ["add", id] => Parsed::Command(Command::PeerAdd(id.to_string())),
        ["remove", id] => Parsed::Command(Command::PeerRemove(id.to_string())),
        ["list"] => Parsed::Command(Command::PeerList),
        _ => Parsed::Usage("Usage: /peer add <id> | /peer remove <id> | /peer list".to_string()),
    }
}

/// Run one parsed command against the live app state and render the reply.
/// Config mutations persist in the background and, where mappings changed,
/// kick off a forwarding rebuild without blocking the acknowledgement.
pub async fn execute(ctx: &AppContext, command: Command) -> String {
    match command {
        Command::Help => HELP_TEXT.to_string(),
        Command::Pause => {
            ctx.paused.store(true, Ordering::SeqCst);
            "Paused. All forwarding and replies are stopped.".to_string()
        }
        Command::Resume => {
            ctx.paused.store(false, Ordering::SeqCst);
            "Resumed.".to_string()
        }
        Command::Status => render_status(ctx).await,
        Command::ListenAdd {
            source,
            destination,
        } => {
            if let Err(e) = validate_forwarding_entry(&source, &destination) {
                return format!("Rejected: {e}");
            }
            let replaced = {
                let mut cfg = ctx.config.write().await;
                match cfg.upsert_forwarding(&source, &destination) {
                    Ok(replaced) => {
                        spawn_persist(cfg.clone(), ctx.config_path.clone());
                        replaced
                    }
                    Err(e) => return format!("Rejected: {e}"),
                }
            };
            ctx.spawn_forwarding_rebuild();
            if replaced {
                format!("Updated: {source} -> {destination}")
            } else {
                format!("Listening: {source} -> {destination}")
            }
        }
        Command::ListenRemove { source } => {
            let removed = {
                let mut cfg = ctx.config.write().await;
                let removed = cfg.remove_forwarding(&source);
                if removed {
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                removed
            };
            if removed {
                ctx.spawn_forwarding_rebuild();
                format!("Removed mapping for {source}")
            } else {
                format!("No mapping for {source}")
            }
        }
        Command::ListenList => {
            let cfg = ctx.config.read().await;
            if cfg.forwarding.is_empty() {
                "No forwarding mappings.".to_string()
            } else {
                cfg.forwarding
                    .iter()
                    .map(|m| format!("{} -> {}", m.source, m.destination))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::AgentOn => {
            mutate(ctx, |cfg| cfg.agent.enabled = true).await;
            "Agent enabled.".to_string()
        }
        Command::AgentOff => {
            mutate(ctx, |cfg| cfg.agent.enabled = false).await;
            "Agent disabled.".to_string()
        }
        Command::AgentEnroll { conversation } => {
            let added = {
                let mut cfg = ctx.config.write().await;
                let added = !cfg.agent.conversations.contains(&conversation);
                if added {
                    cfg.agent.conversations.push(conversation.clone());
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                added
            };
            if added {
                format!("Enrolled {conversation}")
            } else {
                format!("{conversation} is already enrolled")
            }
        }
        Command::AgentUnenroll { conversation } => {
            let removed = {
                let mut cfg = ctx.config.write().await;
                let before = cfg.agent.conversations.len();
                cfg.agent.conversations.retain(|c| c != &conversation);
                let removed = cfg.agent.conversations.len() < before;
                if removed {
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                removed
            };
            if removed {
                format!("Unenrolled {conversation}")
            } else {
                format!("{conversation} was not enrolled")
            }
        }
        Command::AgentProbability(p) => {
            mutate(ctx, |cfg| cfg.agent.reply_probability = p).await;
            format!("Reply probability set to {p}%")
        }
        Command::AgentCooldown(secs) => {
            mutate(ctx, |cfg| cfg.agent.cooldown_seconds = secs).await;
            format!("Cooldown set to {secs}s")
        }
        Command::AgentDelay { min, max } => {
            mutate(ctx, |cfg| {
                cfg.agent.reply_delay_min_secs = min;
                cfg.agent.reply_delay_max_secs = max;
            })
            .await;
            format!("Reply delay set to {min:.1}s-{max:.1}s")
        }
        Command::AgentMinUsers(n) => {
            mutate(ctx, |cfg| cfg.agent.min_active_users = n).await;
            format!("Minimum active users set to {n}")
        }
        Command::AgentWindow(minutes) => {
            mutate(ctx, |cfg| cfg.agent.activity_window_minutes = minutes).await;
            format!("Activity window set to {minutes} minutes")
        }
        Command::AgentResume { conversation } => {
            let conversation = ConversationId::from(conversation);
            if ctx.store.clear_alert(&conversation) {
                format!("Alert cleared for {conversation}; replies re-armed.")
            } else {
                format!("{conversation} was not suspended.")
            }
        }
        Command::AlertOn => {
            mutate(ctx, |cfg| cfg.agent.alert_enabled = true).await;
            "Alert keywords enabled.".to_string()
        }
        Command::AlertOff => {
            mutate(ctx, |cfg| cfg.agent.alert_enabled = false).await;
            "Alert keywords disabled.".to_string()
        }
        Command::AlertAdd(keyword) => {
            let added = {
                let mut cfg = ctx.config.write().await;
                let added = !cfg.agent.alert_keywords.contains(&keyword);
                if added {
                    cfg.agent.alert_keywords.push(keyword.clone());
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                added
            };
            if added {
                format!("Alert keyword added: {keyword}")
            } else {
                format!("Keyword already present: {keyword}")
            }
        }
        Command::AlertRemove(keyword) => {
            let removed = {
                let mut cfg = ctx.config.write().await;
                let before = cfg.agent.alert_keywords.len();
                cfg.agent.alert_keywords.retain(|k| k != &keyword);
                let removed = cfg.agent.alert_keywords.len() < before;
                if removed {
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                removed
            };
            if removed {
                format!("Alert keyword removed: {keyword}")
            } else {
                format!("No such keyword: {keyword}")
            }
        }
        Command::AlertList => {
            let cfg = ctx.config.read().await;
            if cfg.agent.alert_keywords.is_empty() {
                "No alert keywords.".to_string()
            } else {
                cfg.agent.alert_keywords.join(", ")
            }
        }
        Command::ManualOn => {
            mutate(ctx, |cfg| cfg.agent.manual_mode = true).await;
            "Manual mode on. Automated replies and keyword scans are off.".to_string()
        }
        Command::ManualOff => {
            mutate(ctx, |cfg| cfg.agent.manual_mode = false).await;
            "Manual mode off.".to_string()
        }
        Command::ManualSend { conversation, text } => {
            let conversation = ConversationId::from(conversation);
            ctx.store.enqueue_manual(&conversation, text, None);
            ctx.spawn_manual_drain(conversation.clone());
            format!("Queued for {conversation}")
        }
        Command::ManualReply {
            conversation,
            message_id,
            text,
        } => {
            let conversation = ConversationId::from(conversation);
            ctx.store
                .enqueue_manual(&conversation, text, Some(MessageId::from(message_id)));
            ctx.spawn_manual_drain(conversation.clone());
            format!("Queued reply for {conversation}")
        }
        Command::PeerAdd(id) => {
            let added = {
                let mut cfg = ctx.config.write().await;
                let added = !cfg.agent.peer_agent_ids.contains(&id);
                if added {
                    cfg.agent.peer_agent_ids.push(id.clone());
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                added
            };
            if added {
                format!("Peer agent registered: {id}")
            } else {
                format!("Peer agent already registered: {id}")
            }
        }
        Command::PeerRemove(id) => {
            let removed = {
                let mut cfg = ctx.config.write().await;
                let before = cfg.agent.peer_agent_ids.len();
                cfg.agent.peer_agent_ids.retain(|p| p != &id);
                let removed = cfg.agent.peer_agent_ids.len() < before;
                if removed {
                    spawn_persist(cfg.clone(), ctx.config_path.clone());
                }
                removed
            };
            if removed {
                format!("Peer agent removed: {id}")
            } else {
                format!("No such peer agent: {id}")
            }
        }
        Command::PeerList => {
            let cfg = ctx.config.read().await;
            if cfg.agent.peer_agent_ids.is_empty() {
                "No peer agents registered.".to_string()
            } else {
                cfg.agent.peer_agent_ids.join(", ")
            }
        }
    }
}

async fn mutate(ctx: &AppContext, apply: impl FnOnce(&mut crate::config::MurmurConfig)) {
    let mut cfg = ctx.config.write().await;
    apply(&mut cfg);
    spawn_persist(cfg.clone(), ctx.config_path.clone());
}

async fn render_status(ctx: &AppContext) -> String {
    let cfg = ctx.config.read().await;
    let suspended = ctx.store.suspended_conversations();
    let suspended = if suspended.is_empty() {
        "none".to_string()
    } else {
        suspended
            .iter()
            .map(|c| c.as_str().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "paused={}\nagent_enabled={}\nmanual_mode={}\nenrolled={}\nforwarding_mappings={}\n\
         reply_probability={}%\ncooldown={}s\nmin_active_users={}\nactivity_window={}m\n\
         alert_enabled={}\nalert_keywords={}\nsuspended={}",
        ctx.paused.load(Ordering::SeqCst),
        cfg.agent.enabled,
        cfg.agent.manual_mode,
        cfg.agent.conversations.len(),
        ctx.forwarding.len().await,
        cfg.agent.reply_probability,
        cfg.agent.cooldown_seconds,
        cfg.agent.min_active_users,
        cfg.agent.activity_window_minutes,
        cfg.agent.alert_enabled,
        cfg.agent.alert_keywords.join(","),
        suspended,
    )
}
