//! Reply decision and emission pipeline.
//!
//! Every inbound event flows through one pass: bookkeeping first
//! (sender window, context window), then suppression checks (peer agents,
//! alert keywords, suspension, manual mode), then the reply gates, then
//! generation and a humanized send. The decision logic itself is pure and
//! takes the clock and the dice roll as arguments.

use crate::alert::scan_keywords;
use crate::config::MurmurConfig;
use crate::context::{ContextLine, SELF_ROLE};
use crate::store::ConversationStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mm_transport::{ConversationId, InboundEvent, Transport};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Fixed answer probability for mentions and replies to our own messages.
const DIRECT_REPLY_PROBABILITY: u8 = 90;

/// Chance that a reply to a mention is threaded onto the trigger message.
const THREADED_MENTION_PROBABILITY: f64 = 0.7;

/// Sentinel the model emits to decline a turn.
const SKIP_SENTINEL: &str = "[SKIP]";

/// Context lines included in the generation prompt.
const PROMPT_CONTEXT_LINES: usize = 15;

const EMOJIS: [&str; 30] = [
    "😂", "🤣", "😊", "😄", "👍", "🔥", "💪", "😎", "🤔", "😏", "🙃", "😜", "🤭", "😁", "👀",
    "💯", "✨", "🎉", "😋", "🥰", "😤", "🤷", "😅", "🙈", "💀", "😭", "🤡", "👏", "🤝", "😌",
];

/// Text completion seam; the production impl is `mm_llm::ChatClient`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_turn: &str) -> Result<String>;
}

#[async_trait]
impl Generator for mm_llm::ChatClient {
    async fn generate(&self, system_prompt: &str, user_turn: &str) -> Result<String> {
        Ok(self.complete(system_prompt, user_turn).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reply,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooShort,
    QuietRoom,
    Cooldown,
    LostRoll,
}

pub struct DecisionInput<'a> {
    pub direct: bool,
    pub text: &'a str,
    pub active_users: usize,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// A mention of our handle or a reply to one of our own messages counts as
/// direct and bypasses the ambient gates.
pub fn classify_direct(text: &str, handle: &str, reply_to_self: bool) -> bool {
    if reply_to_self {
        return true;
    }
    let handle = handle.trim();
    !handle.is_empty() && text.to_lowercase().contains(&handle.to_lowercase())
}

/// Pure gate evaluation. `roll` is uniform in 1..=100; a reply happens when
/// the roll lands at or under the effective probability.
pub fn decide(input: &DecisionInput<'_>, agent: &crate::config::AgentConfig, roll: u8) -> Decision {
    if input.direct {
        return if roll <= DIRECT_REPLY_PROBABILITY {
            Decision::Reply
        } else {
            Decision::Skip(SkipReason::LostRoll)
        };
    }

    if input.active_users < agent.min_active_users {
        return Decision::Skip(SkipReason::QuietRoom);
    }
    if input.text.trim().chars().count() < agent.min_message_length {
        return Decision::Skip(SkipReason::TooShort);
    }
    if let Some(last) = input.last_reply_at {
        if input.now - last < ChronoDuration::seconds(agent.cooldown_seconds as i64) {
            return Decision::Skip(SkipReason::Cooldown);
        }
    }
    if roll <= agent.reply_probability {
        Decision::Reply
    } else {
        Decision::Skip(SkipReason::LostRoll)
    }
}

/// Humanized pre-send pause. Direct replies pause longer, simulating reading
/// and thinking; ambient replies scale with the reply length, capped at 5s.
pub fn humanized_delay(
    reply: &str,
    direct: bool,
    delay_min_secs: f64,
    delay_max_secs: f64,
    rng: &mut impl Rng,
) -> Duration {
    let secs = if direct {
        if delay_max_secs > delay_min_secs {
            rng.gen_range(delay_min_secs..delay_max_secs)
        } else {
            delay_min_secs
        }
    } else {
        let base = reply.chars().count() as f64 * rng.gen_range(0.1..0.2);
        (base + rng.gen_range(0.5..2.0)).min(5.0)
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// 40% of replies get one emoji, appended or prepended with even odds.
pub fn decorate_reply(text: String, rng: &mut impl Rng) -> String {
    if !rng.gen_bool(0.4) {
        return text;
    }
    let emoji = EMOJIS[rng.gen_range(0..EMOJIS.len())];
    if rng.gen_bool(0.5) {
        format!("{text}{emoji}")
    } else {
        format!("{emoji}{text}")
    }
}

/// A completion containing the sentinel, or nothing at all, is a declined
/// turn.
pub fn extract_reply(completion: &str) -> Option<String> {
    if completion.contains(SKIP_SENTINEL) {
        return None;
    }
    let trimmed = completion.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn build_system_prompt(
    personality: &str,
    context: &[ContextLine],
    sender_name: &str,
    trigger: &str,
) -> String {
    let mut transcript = String::new();
    for line in context {
        transcript.push_str(&line.render());
        transcript.push('\n');
    }
    format!(
        "{personality}\n\n\
         You are in a group conversation. Recent messages:\n\
         {transcript}\n\
         Now {sender_name} said: \"{trigger}\"\n\n\
         Reply to this message like a real person. Rules:\n\
         1. Sound natural and conversational.\n\
         2. Keep it short, one or two sentences.\n\
         3. Casual slang is fine.\n\
         4. You may riff on a related topic instead of answering directly.\n\
         5. Light teasing is fine, never mean.\n\
         6. Never reveal that you are automated.\n\
         7. If the topic is dull or not worth answering, reply exactly {SKIP_SENTINEL}.\n\n\
         Output only the reply text, no prefix or explanation."
    )
}

pub struct ReplyEngine {
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    generator: Arc<RwLock<Option<Arc<dyn Generator>>>>,
    config: Arc<RwLock<MurmurConfig>>,
}

impl ReplyEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
        generator: Arc<RwLock<Option<Arc<dyn Generator>>>>,
        config: Arc<RwLock<MurmurConfig>>,
    ) -> Self {
        Self {
            store,
            transport,
            generator,
            config,
        }
    }

    /// Full per-event pass. Errors are logged, never propagated; one bad
    /// event must not take the loop down.
    pub async fn handle_event(&self, event: InboundEvent) {
        let cfg = self.config.read().await.clone();
        let conversation = event.conversation_id.clone();

        self.store
            .record_sender(&conversation, event.sender_id.clone(), event.received_at);
        if !event.text.trim().is_empty() {
            self.store.push_context(
                &conversation,
                &event.sender_name,
                &event.text,
                event.received_at,
                cfg.agent.context_limit,
            );
        }

        if cfg
            .agent
            .peer_agent_ids
            .iter()
            .any(|id| id == event.sender_id.as_str())
        {
            tracing::trace!(conversation = %conversation, sender = %event.sender_id, "peer agent message ignored");
            return;
        }

        let enrolled = cfg
            .agent
            .conversations
            .iter()
            .any(|c| c == conversation.as_str());

        // Keyword scan runs only for enrolled conversations and never while
        // the operator has taken over manually.
        if cfg.agent.alert_enabled && enrolled && !cfg.agent.manual_mode {
            if let Some(keyword) = scan_keywords(&event.text, &cfg.agent.alert_keywords) {
                let newly = self.store.trigger_alert(
                    &conversation,
                    keyword,
                    &event.text,
                    &event.sender_name,
                    event.received_at,
                );
                if newly {
                    tracing::warn!(
                        conversation = %conversation,
                        keyword,
                        sender = %event.sender_name,
                        "alert keyword hit, conversation suspended"
                    );
                    self.notify_operator(&cfg, &conversation, keyword, &event).await;
                }
                return;
            }
        }

        if self.store.is_suspended(&conversation) {
            return;
        }
        if !cfg.agent.enabled || !enrolled || cfg.agent.manual_mode {
            return;
        }
        if event.text.trim().is_empty() {
            return;
        }

        let direct = classify_direct(&event.text, &cfg.agent.handle, event.reply_to_self);
        let now = Utc::now();
        let input = DecisionInput {
            direct,
            text: &event.text,
            active_users: self.store.active_user_count(
                &conversation,
                cfg.agent.activity_window_minutes,
                now,
            ),
            last_reply_at: self.store.last_reply_at(&conversation),
            now,
        };
        let (roll, thread_roll) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..=100u8), rng.gen_bool(THREADED_MENTION_PROBABILITY))
        };
        match decide(&input, &cfg.agent, roll) {
            Decision::Reply => {}
            Decision::Skip(reason) => {
                tracing::trace!(conversation = %conversation, ?reason, "reply skipped");
                return;
            }
        }

        let generator = match self.generator.read().await.clone() {
            Some(g) => g,
            None => {
                tracing::warn!("no generation client configured, reply skipped");
                return;
            }
        };

        let context = self.store.context_tail(&conversation, PROMPT_CONTEXT_LINES);
        let prompt =
            build_system_prompt(&cfg.agent.personality, &context, &event.sender_name, &event.text);
        let reply = match generator.generate(&prompt, &event.text).await {
            Ok(completion) => match extract_reply(&completion) {
                Some(reply) => reply,
                None => {
                    tracing::debug!(conversation = %conversation, "model declined the turn");
                    return;
                }
            },
            Err(error) => {
                tracing::warn!(conversation = %conversation, %error, "reply generation failed");
                return;
            }
        };

        let (reply, delay) = {
            let mut rng = rand::thread_rng();
            let reply = if cfg.agent.random_emoji {
                decorate_reply(reply, &mut rng)
            } else {
                reply
            };
            let delay = if cfg.agent.typing_simulation {
                humanized_delay(
                    &reply,
                    direct,
                    cfg.agent.reply_delay_min_secs,
                    cfg.agent.reply_delay_max_secs,
                    &mut rng,
                )
            } else {
                Duration::ZERO
            };
            (reply, delay)
        };

        if !delay.is_zero() {
            if self.transport.supports_composing() {
                let _ = self.transport.set_composing(&conversation, true).await;
            }
            tokio::time::sleep(delay).await;
            if self.transport.supports_composing() {
                let _ = self.transport.set_composing(&conversation, false).await;
            }
        }

        // State may have moved while we were generating or pausing; a reply
        // into a suspended or taken-over conversation is discarded.
        {
            let cfg = self.config.read().await;
            if self.store.is_suspended(&conversation)
                || !cfg.agent.enabled
                || cfg.agent.manual_mode
            {
                tracing::debug!(conversation = %conversation, "stale reply discarded");
                return;
            }
        }

        let reply_to = if event.reply_to_self || (direct && thread_roll) {
            Some(&event.message_id)
        } else {
            None
        };
        if let Err(error) = self.transport.send(&conversation, &reply, reply_to).await {
            tracing::warn!(conversation = %conversation, %error, "reply send failed");
            return;
        }

        let sent_at = Utc::now();
        self.store.mark_replied(&conversation, sent_at);
        self.store
            .push_context(&conversation, SELF_ROLE, &reply, sent_at, cfg.agent.context_limit);
        tracing::info!(conversation = %conversation, direct, "reply sent");
    }

    async fn notify_operator(
        &self,
        cfg: &MurmurConfig,
        conversation: &ConversationId,
        keyword: &str,
        event: &InboundEvent,
    ) {
        let operator = cfg.general.operator_id.trim();
        if operator.is_empty() {
            return;
        }
        let snippet: String = event.text.chars().take(200).collect();
        let notice = format!(
            "Alert: keyword \"{keyword}\" in conversation {conversation}\n\
             from {sender}: {snippet}\n\
             Automated replies are suspended there.\n\
             Use `agent resume {conversation}` to re-arm, or `manual on` to take over.",
            sender = event.sender_name,
        );
        let operator_conversation = ConversationId::from(operator);
        if let Err(error) = self
            .transport
            .send(&operator_conversation, &notice, None)
            .await
        {
            tracing::warn!(%error, "alert notification to operator failed");
        }
    }
}

/// Delivery path for operator-queued messages; skips every gate except a
/// short typing pause. Drains hold the conversation's delivery lock, so two
/// overlapping drains cannot reorder the queue.
pub async fn deliver_manual(
    transport: &dyn Transport,
    store: &ConversationStore,
    conversation: &ConversationId,
    context_limit: usize,
) -> usize {
    let lock = store.delivery_lock(conversation);
    let _guard = lock.lock().await;
    let mut delivered = 0;
    while let Some(message) = store.dequeue_manual(conversation) {
        let delay = {
            let mut rng = rand::thread_rng();
            Duration::from_secs_f64(rng.gen_range(1.0..3.0))
        };
        if transport.supports_composing() {
            let _ = transport.set_composing(conversation, true).await;
        }
        tokio::time::sleep(delay).await;
        if transport.supports_composing() {
            let _ = transport.set_composing(conversation, false).await;
        }

        if let Err(error) = transport
            .send(conversation, &message.text, message.reply_to.as_ref())
            .await
        {
            tracing::warn!(conversation = %conversation, %error, "manual message send failed");
            continue;
        }
        let now = Utc::now();
        store.push_context(conversation, SELF_ROLE, &message.text, now, context_limit);
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use chrono::TimeZone;
    use mm_transport::{Destination, MessageId, SenderId};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn agent() -> AgentConfig {
        AgentConfig {
            enabled: true,
            reply_probability: 30,
            min_message_length: 3,
            cooldown_seconds: 30,
            min_active_users: 3,
            ..AgentConfig::default()
        }
    }

    fn ambient_input<'a>(text: &'a str, active: usize, last: Option<DateTime<Utc>>) -> DecisionInput<'a> {
        DecisionInput {
            direct: false,
            text,
            active_users: active,
            last_reply_at: last,
            now: now(),
        }
    }

    #[test]
    fn direct_events_bypass_every_ambient_gate() {
        let agent = agent();
        // Quiet room, short text, inside cooldown: direct still replies.
        let input = DecisionInput {
            direct: true,
            text: "hi",
            active_users: 0,
            last_reply_at: Some(now() - ChronoDuration::seconds(1)),
            now: now(),
        };
        assert_eq!(decide(&input, &agent, 90), Decision::Reply);
        assert_eq!(decide(&input, &agent, 91), Decision::Skip(SkipReason::LostRoll));
    }

    #[test]
    fn quiet_room_gate_wins_before_length_and_cooldown() {
        let agent = agent();
        let input = ambient_input("hello there", 2, None);
        assert_eq!(decide(&input, &agent, 1), Decision::Skip(SkipReason::QuietRoom));
    }

    #[test]
    fn short_messages_are_skipped() {
        let agent = agent();
        let input = ambient_input("ok", 5, None);
        assert_eq!(decide(&input, &agent, 1), Decision::Skip(SkipReason::TooShort));
    }

    #[test]
    fn cooldown_boundary_at_thirty_seconds() {
        let agent = agent();
        let replied = now() - ChronoDuration::seconds(10);
        let input = ambient_input("what do you all think", 5, Some(replied));
        assert_eq!(decide(&input, &agent, 1), Decision::Skip(SkipReason::Cooldown));

        let replied = now() - ChronoDuration::seconds(31);
        let input = ambient_input("what do you all think", 5, Some(replied));
        assert_eq!(decide(&input, &agent, 1), Decision::Reply);
    }

    #[test]
    fn ambient_roll_is_compared_to_configured_probability() {
        let agent = agent();
        let input = ambient_input("interesting topic here", 5, None);
        assert_eq!(decide(&input, &agent, 30), Decision::Reply);
        assert_eq!(decide(&input, &agent, 31), Decision::Skip(SkipReason::LostRoll));
    }

    #[test]
    fn mention_and_reply_to_self_classify_as_direct() {
        assert!(classify_direct("hey @murmur what gives", "@murmur", false));
        assert!(classify_direct("HEY @MURMUR", "@murmur", false));
        assert!(classify_direct("anything", "@murmur", true));
        assert!(!classify_direct("hey folks", "@murmur", false));
        assert!(!classify_direct("hey @murmur", "", false));
    }

    #[test]
    fn skip_sentinel_and_blank_completions_are_declined() {
        assert_eq!(extract_reply("sure thing"), Some("sure thing".to_string()));
        assert_eq!(extract_reply("  padded  "), Some("padded".to_string()));
        assert_eq!(extract_reply("[SKIP]"), None);
        assert_eq!(extract_reply("boring [SKIP]"), None);
        assert_eq!(extract_reply(""), None);
        assert_eq!(extract_reply("   "), None);
    }

    #[test]
    fn ambient_delay_is_capped_at_five_seconds() {
        let mut rng = rand::thread_rng();
        let long = "x".repeat(400);
        for _ in 0..50 {
            let delay = humanized_delay(&long, false, 2.0, 5.0, &mut rng);
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn direct_delay_stays_inside_the_configured_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let delay = humanized_delay("hey", true, 2.0, 5.0, &mut rng);
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn prompt_carries_personality_context_and_trigger() {
        let context = vec![ContextLine {
            role: "Ann".to_string(),
            content: "anyone around?".to_string(),
            at: now(),
        }];
        let prompt = build_system_prompt("Be breezy.", &context, "Bob", "what's up");
        assert!(prompt.starts_with("Be breezy."));
        assert!(prompt.contains("[12:00] Ann: anyone around?"));
        assert!(prompt.contains("Now Bob said: \"what's up\""));
        assert!(prompt.contains(SKIP_SENTINEL));
    }

    // Full-pipeline tests below use a recording transport and a scripted
    // generator; paused time makes the typing pause free.

    #[derive(Default)]
    struct SentLog {
        sent: Mutex<Vec<(String, String, Option<String>)>>,
    }

    struct ScriptedTransport {
        log: Arc<SentLog>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }

        async fn resolve(&self, reference: &str) -> Result<Destination> {
            Ok(Destination {
                id: reference.to_string(),
                display_name: reference.to_string(),
            })
        }

        async fn forward(
            &self,
            _message_ids: &[MessageId],
            _from: &ConversationId,
            _to: &Destination,
        ) -> Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            conversation: &ConversationId,
            text: &str,
            reply_to: Option<&MessageId>,
        ) -> Result<()> {
            self.log.sent.lock().expect("sent lock").push((
                conversation.to_string(),
                text.to_string(),
                reply_to.map(|id| id.to_string()),
            ));
            Ok(())
        }
    }

    struct ScriptedGenerator {
        completion: String,
        // Flipped during generation to exercise the stale-reply check.
        suspend_on_call: Option<(Arc<ConversationStore>, ConversationId)>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _system_prompt: &str, _user_turn: &str) -> Result<String> {
            if let Some((store, conversation)) = &self.suspend_on_call {
                store.trigger_alert(conversation, "bot", "are you a bot", "Ann", Utc::now());
            }
            Ok(self.completion.clone())
        }
    }

    fn event(conversation: &str, sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            conversation_id: ConversationId::from(conversation),
            sender_id: SenderId::from(sender),
            sender_name: format!("name-{sender}"),
            message_id: MessageId::from("500"),
            text: text.to_string(),
            group_id: None,
            reply_to_id: None,
            reply_to_self: false,
            is_private: false,
            received_at: Utc::now(),
        }
    }

    fn engine_fixture(
        cfg: MurmurConfig,
        completion: &str,
        suspend_on_call: bool,
    ) -> (ReplyEngine, Arc<ConversationStore>, Arc<SentLog>) {
        let store = Arc::new(ConversationStore::new());
        let log = Arc::new(SentLog::default());
        let transport = Arc::new(ScriptedTransport {
            log: Arc::clone(&log),
        });
        let generator = ScriptedGenerator {
            completion: completion.to_string(),
            suspend_on_call: suspend_on_call
                .then(|| (Arc::clone(&store), ConversationId::from("-100"))),
        };
        let engine = ReplyEngine::new(
            Arc::clone(&store),
            transport,
            Arc::new(RwLock::new(Some(Arc::new(generator) as Arc<dyn Generator>))),
            Arc::new(RwLock::new(cfg)),
        );
        (engine, store, log)
    }

    fn pipeline_config() -> MurmurConfig {
        let mut cfg = MurmurConfig::default();
        cfg.general.operator_id = "900".to_string();
        cfg.agent.enabled = true;
        cfg.agent.conversations = vec!["-100".to_string()];
        // Deterministic ambient path: always win the roll, no gates in the way.
        cfg.agent.reply_probability = 100;
        cfg.agent.min_active_users = 1;
        cfg.agent.random_emoji = false;
        cfg.agent.typing_simulation = false;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn ambient_reply_flows_end_to_end() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "sounds fun", false);
        engine.handle_event(event("-100", "u1", "anyone up for games")).await;

        let sent = log.sent.lock().expect("sent lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "-100");
        assert_eq!(sent[0].1, "sounds fun");
        assert_eq!(sent[0].2, None);

        let conversation = ConversationId::from("-100");
        assert!(store.last_reply_at(&conversation).is_some());
        let tail = store.context_tail(&conversation, 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].role, SELF_ROLE);
        assert_eq!(tail[1].content, "sounds fun");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_agent_messages_update_context_but_never_answer() {
        let mut cfg = pipeline_config();
        cfg.agent.peer_agent_ids = vec!["u-peer".to_string()];
        let (engine, store, log) = engine_fixture(cfg, "sounds fun", false);

        engine.handle_event(event("-100", "u-peer", "hello from a peer")).await;

        assert!(log.sent.lock().expect("sent lock").is_empty());
        let conversation = ConversationId::from("-100");
        assert_eq!(store.context_tail(&conversation, 10).len(), 1);
        assert_eq!(store.active_user_count(&conversation, 10, Utc::now()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn alert_keyword_suspends_and_notifies_operator_once() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "sounds fun", false);

        engine.handle_event(event("-100", "u1", "are you a bot?")).await;
        let conversation = ConversationId::from("-100");
        assert!(store.is_suspended(&conversation));
        {
            let sent = log.sent.lock().expect("sent lock").clone();
            assert_eq!(sent.len(), 1, "exactly one operator notice");
            assert_eq!(sent[0].0, "900");
            assert!(sent[0].1.contains("bot"));
        }

        // Repeat hit: recorded, no second notice.
        engine.handle_event(event("-100", "u2", "definitely a bot")).await;
        assert_eq!(log.sent.lock().expect("sent lock").len(), 1);

        // Ordinary traffic while suspended: context grows, no reply.
        engine.handle_event(event("-100", "u3", "so what are we doing tonight")).await;
        assert_eq!(log.sent.lock().expect("sent lock").len(), 1);
        assert_eq!(store.context_tail(&conversation, 10).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_disables_scan_and_replies() {
        let mut cfg = pipeline_config();
        cfg.agent.manual_mode = true;
        let (engine, store, log) = engine_fixture(cfg, "sounds fun", false);

        engine.handle_event(event("-100", "u1", "are you a bot?")).await;

        assert!(log.sent.lock().expect("sent lock").is_empty());
        assert!(!store.is_suspended(&ConversationId::from("-100")));
    }

    #[tokio::test(start_paused = true)]
    async fn unenrolled_conversations_only_get_bookkeeping() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "sounds fun", false);

        engine.handle_event(event("-777", "u1", "long enough message here")).await;

        assert!(log.sent.lock().expect("sent lock").is_empty());
        assert_eq!(store.context_tail(&ConversationId::from("-777"), 10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_completion_sends_nothing_and_keeps_cooldown_clear() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "[SKIP]", false);

        engine.handle_event(event("-100", "u1", "anyone up for games")).await;

        assert!(log.sent.lock().expect("sent lock").is_empty());
        assert!(store.last_reply_at(&ConversationId::from("-100")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_generated_before_suspension_is_discarded() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "sounds fun", true);

        engine.handle_event(event("-100", "u1", "anyone up for games")).await;

        assert!(log.sent.lock().expect("sent lock").is_empty());
        let conversation = ConversationId::from("-100");
        assert!(store.is_suspended(&conversation));
        assert!(store.last_reply_at(&conversation).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_manual_drains_deliver_in_fifo_order() {
        let store = Arc::new(ConversationStore::new());
        let log = Arc::new(SentLog::default());
        let transport = Arc::new(ScriptedTransport {
            log: Arc::clone(&log),
        });
        let conversation = ConversationId::from("-100");

        let spawn_drain = |transport: Arc<ScriptedTransport>,
                           store: Arc<ConversationStore>,
                           conversation: ConversationId| {
            tokio::spawn(async move {
                deliver_manual(transport.as_ref(), &store, &conversation, 20).await
            })
        };

        store.enqueue_manual(&conversation, "first".to_string(), None);
        let drain_a = spawn_drain(
            Arc::clone(&transport),
            Arc::clone(&store),
            conversation.clone(),
        );
        store.enqueue_manual(&conversation, "second".to_string(), None);
        let drain_b = spawn_drain(
            Arc::clone(&transport),
            Arc::clone(&store),
            conversation.clone(),
        );

        let delivered = drain_a.await.expect("drain a") + drain_b.await.expect("drain b");
        assert_eq!(delivered, 2);
        let sent: Vec<String> = log
            .sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(_, text, _)| text.clone())
            .collect();
        assert_eq!(sent, ["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_queue_delivery_skips_every_gate() {
        let (engine, store, log) = engine_fixture(pipeline_config(), "unused", false);
        let conversation = ConversationId::from("-100");
        store.trigger_alert(&conversation, "bot", "bot?", "Ann", Utc::now());
        store.enqueue_manual(&conversation, "hand-written".to_string(), Some(MessageId::from("9")));

        let delivered = deliver_manual(&*engine.transport, &engine.store, &conversation, 20).await;

        assert_eq!(delivered, 1);
        let sent = log.sent.lock().expect("sent lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "hand-written");
        assert_eq!(sent[0].2, Some("9".to_string()));
        let tail = store.context_tail(&conversation, 10);
        assert_eq!(tail.last().map(|l| l.role.clone()), Some(SELF_ROLE.to_string()));
    }
}
