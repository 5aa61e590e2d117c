//! Murmur configuration loader and persister.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MurmurConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub coalescer: CoalescerConfig,
    #[serde(default)]
    pub forwarding: Vec<ForwardingEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Operator account id: receives alert notifications, may issue commands.
    #[serde(default)]
    pub operator_id: String,
    /// Additional account ids allowed to issue commands.
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_generation_base_url(),
            model: default_generation_model(),
        }
    }
}

fn default_generation_base_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_generation_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The account's @handle; mentions of it classify an event as direct.
    #[serde(default)]
    pub handle: String,
    /// Conversations enrolled for automated participation.
    #[serde(default)]
    pub conversations: Vec<String>,
    #[serde(default = "default_personality")]
    pub personality: String,
    /// Percentage chance of answering an ambient message, 0-100.
    #[serde(default = "default_reply_probability")]
    pub reply_probability: u8,
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub typing_simulation: bool,
    #[serde(default = "default_true")]
    pub random_emoji: bool,
    #[serde(default = "default_true")]
    pub alert_enabled: bool,
    #[serde(default = "default_alert_keywords")]
    pub alert_keywords: Vec<String>,
    #[serde(default)]
    pub manual_mode: bool,
    /// Peer automation accounts whose messages are never answered.
    #[serde(default)]
    pub peer_agent_ids: Vec<String>,
    #[serde(default = "default_min_active_users")]
    pub min_active_users: usize,
    #[serde(default = "default_activity_window_minutes")]
    pub activity_window_minutes: i64,
    #[serde(default = "default_reply_delay_min_secs")]
    pub reply_delay_min_secs: f64,
    #[serde(default = "default_reply_delay_max_secs")]
    pub reply_delay_max_secs: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            handle: String::new(),
            conversations: Vec::new(),
            personality: default_personality(),
            reply_probability: default_reply_probability(),
            min_message_length: default_min_message_length(),
            context_limit: default_context_limit(),
            cooldown_seconds: default_cooldown_seconds(),
            typing_simulation: true,
            random_emoji: true,
            alert_enabled: true,
            alert_keywords: default_alert_keywords(),
            manual_mode: false,
            peer_agent_ids: Vec::new(),
            min_active_users: default_min_active_users(),
            activity_window_minutes: default_activity_window_minutes(),
            reply_delay_min_secs: default_reply_delay_min_secs(),
            reply_delay_max_secs: default_reply_delay_max_secs(),
        }
    }
}

fn default_personality() -> String {
    "You are an upbeat, casual chat participant. Keep replies short and \
     playful, one or two sentences at most, and never reveal that you are \
     automated."
        .to_string()
}

fn default_reply_probability() -> u8 {
    30
}

fn default_min_message_length() -> usize {
    3
}

fn default_context_limit() -> usize {
    20
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_alert_keywords() -> Vec<String> {
    ["bot", "robot", "ai", "automated", "script"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_min_active_users() -> usize {
    3
}

fn default_activity_window_minutes() -> i64 {
    10
}

fn default_reply_delay_min_secs() -> f64 {
    2.0
}

fn default_reply_delay_max_secs() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Quiescence window after the last part of a media group, milliseconds.
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: default_quiescence_ms(),
        }
    }
}

fn default_quiescence_ms() -> u64 {
    1500
}

/// One forwarding mapping, unique by source; last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingEntry {
    pub source: String,
    pub destination: String,
}

impl Default for MurmurConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            telegram: TelegramConfig::default(),
            generation: GenerationConfig::default(),
            agent: AgentConfig::default(),
            coalescer: CoalescerConfig::default(),
            forwarding: Vec::new(),
        }
    }
}

impl MurmurConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: MurmurConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.telegram.bot_token = v;
            }
        }
        if let Ok(v) = std::env::var("MURMUR_GENERATION_API_KEY") {
            if !v.trim().is_empty() {
                self.generation.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("MURMUR_OPERATOR_ID") {
            if !v.trim().is_empty() {
                self.general.operator_id = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.operator_id.trim().is_empty() {
            return Err(anyhow::anyhow!("general.operator_id is required"));
        }
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram.bot_token is required"));
        }
        if self.agent.reply_probability > 100 {
            return Err(anyhow::anyhow!("agent.reply_probability must be 0-100"));
        }
        if self.agent.context_limit == 0 {
            return Err(anyhow::anyhow!("agent.context_limit must be > 0"));
        }
        if self.agent.activity_window_minutes <= 0 {
            return Err(anyhow::anyhow!("agent.activity_window_minutes must be > 0"));
        }
        if self.agent.reply_delay_min_secs < 0.0
            || self.agent.reply_delay_max_secs < self.agent.reply_delay_min_secs
        {
            return Err(anyhow::anyhow!(
                "agent.reply_delay range is invalid: min={} max={}",
                self.agent.reply_delay_min_secs,
                self.agent.reply_delay_max_secs
            ));
        }
        if self.coalescer.quiescence_ms == 0 {
            return Err(anyhow::anyhow!("coalescer.quiescence_ms must be > 0"));
        }
        for entry in &self.forwarding {
            validate_forwarding_entry(&entry.source, &entry.destination)?;
        }
        Ok(())
    }

    /// Insert or replace the mapping for `source`. Returns true on replace.
    pub fn upsert_forwarding(&mut self, source: &str, destination: &str) -> Result<bool> {
        validate_forwarding_entry(source, destination)?;
        let replaced = self.remove_forwarding(source);
        self.forwarding.push(ForwardingEntry {
            source: source.to_string(),
            destination: destination.to_string(),
        });
        Ok(replaced)
    }

    /// Returns true when a mapping for `source` existed and was removed.
    pub fn remove_forwarding(&mut self, source: &str) -> bool {
        let before = self.forwarding.len();
        self.forwarding.retain(|m| m.source != source);
        self.forwarding.len() < before
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("create config dir {}: {e}", parent.display()))?;
        }
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| anyhow::anyhow!("write config {}: {e}", path.display()))?;
        Ok(())
    }
}

/// Mutation-boundary check: a malformed mapping never reaches the runtime map.
pub fn validate_forwarding_entry(source: &str, destination: &str) -> Result<()> {
    if source.trim().is_empty() {
        return Err(anyhow::anyhow!("forwarding source must not be empty"));
    }
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(anyhow::anyhow!("forwarding destination must not be empty"));
    }
    if !destination.starts_with('@') && destination.parse::<i64>().is_err() {
        return Err(anyhow::anyhow!(
            "forwarding destination must be an @username or a numeric id: {destination}"
        ));
    }
    Ok(())
}

/// Per-path write ordering: tickets are handed out at call time (callers
/// hold the config lock, so ticket order is mutation order) and a lagging
/// older snapshot is dropped instead of overwriting a newer one on disk.
struct PersistState {
    ticket: AtomicU64,
    written: AtomicU64,
    guard: tokio::sync::Mutex<()>,
}

fn persist_state(path: &Path) -> Arc<PersistState> {
    static STATES: OnceLock<StdMutex<HashMap<PathBuf, Arc<PersistState>>>> = OnceLock::new();
    let states = STATES.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut states = states.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(states.entry(path.to_path_buf()).or_insert_with(|| {
        Arc::new(PersistState {
            ticket: AtomicU64::new(0),
            written: AtomicU64::new(0),
            guard: tokio::sync::Mutex::new(()),
        })
    }))
}

async fn persist_in_order(state: Arc<PersistState>, ticket: u64, cfg: MurmurConfig, path: PathBuf) {
    let _io = state.guard.lock().await;
    if ticket <= state.written.load(Ordering::SeqCst) {
        tracing::debug!(ticket, path = %path.display(), "config persist superseded; skipped");
        return;
    }
    match cfg.persist(&path).await {
        Ok(()) => {
            state.written.store(ticket, Ordering::SeqCst);
            tracing::debug!(path = %path.display(), "config persisted");
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "config persist failed");
        }
    }
}

/// Persist in the background; mutation commands never block on disk.
pub fn spawn_persist(cfg: MurmurConfig, path: PathBuf) {
    let state = persist_state(&path);
    let ticket = state.ticket.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(persist_in_order(state, ticket, cfg, path));
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".murmur").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MurmurConfig {
        let mut cfg = MurmurConfig::default();
        cfg.general.operator_id = "100".to_string();
        cfg.telegram.bot_token = "token".to_string();
        cfg
    }

    #[test]
    fn defaults_match_documented_tunables() {
        let cfg = MurmurConfig::default();
        assert_eq!(cfg.agent.reply_probability, 30);
        assert_eq!(cfg.agent.cooldown_seconds, 30);
        assert_eq!(cfg.agent.context_limit, 20);
        assert_eq!(cfg.agent.min_active_users, 3);
        assert_eq!(cfg.agent.activity_window_minutes, 10);
        assert_eq!(cfg.coalescer.quiescence_ms, 1500);
        assert!(cfg.agent.typing_simulation);
        assert!(!cfg.agent.enabled);
    }

    #[test]
    fn validate_rejects_out_of_range_tunables() {
        let mut cfg = valid_config();
        cfg.agent.reply_probability = 101;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.agent.reply_delay_min_secs = 5.0;
        cfg.agent.reply_delay_max_secs = 2.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.coalescer.quiescence_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn forwarding_entry_validation_guards_the_mutation_boundary() {
        assert!(validate_forwarding_entry("-100123", "@dest").is_ok());
        assert!(validate_forwarding_entry("-100123", "200300").is_ok());
        assert!(validate_forwarding_entry("", "@dest").is_err());
        assert!(validate_forwarding_entry("-100123", "dest-without-at").is_err());
    }

    #[test]
    fn upsert_is_last_write_wins_by_source() {
        let mut cfg = valid_config();
        assert!(!cfg.upsert_forwarding("-1", "@a").expect("insert"));
        assert!(cfg.upsert_forwarding("-1", "@b").expect("replace"));
        assert_eq!(cfg.forwarding.len(), 1);
        assert_eq!(cfg.forwarding[0].destination, "@b");
        assert!(cfg.remove_forwarding("-1"));
        assert!(!cfg.remove_forwarding("-1"));
    }

    #[tokio::test]
    async fn lagging_persist_never_overwrites_a_newer_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let state = persist_state(&path);

        let mut older = valid_config();
        older.agent.cooldown_seconds = 111;
        let mut newer = valid_config();
        newer.agent.cooldown_seconds = 222;

        let old_ticket = state.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let new_ticket = state.ticket.fetch_add(1, Ordering::SeqCst) + 1;

        // The newer snapshot reaches disk first; the older write lags.
        persist_in_order(Arc::clone(&state), new_ticket, newer, path.clone()).await;
        persist_in_order(Arc::clone(&state), old_ticket, older, path.clone()).await;

        let (reloaded, _) = MurmurConfig::load_with_path(Some(path))
            .await
            .expect("reload");
        assert_eq!(reloaded.agent.cooldown_seconds, 222);
    }

    #[tokio::test]
    async fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut cfg = valid_config();
        cfg.agent.enabled = true;
        cfg.agent.conversations = vec!["-100555".to_string()];
        cfg.upsert_forwarding("-100555", "@sink").expect("upsert");
        cfg.persist(&path).await.expect("persist");

        let (reloaded, loaded_path) = MurmurConfig::load_with_path(Some(path.clone()))
            .await
            .expect("reload");
        assert_eq!(loaded_path, path);
        assert!(reloaded.agent.enabled);
        assert_eq!(reloaded.forwarding.len(), 1);
        assert_eq!(reloaded.forwarding[0].source, "-100555");
    }
}
