//! Process wiring: startup, the inbound event loop, and shutdown.

use crate::coalescer::MediaGroupCoalescer;
use crate::commands::{self, Parsed};
use crate::config::{MurmurConfig, default_config_path};
use crate::engine::{self, Generator, ReplyEngine};
use crate::forwarding::ForwardingMap;
use crate::store::ConversationStore;
use anyhow::{Context, Result};
use mm_llm::ChatClient;
use mm_transport::{ConversationId, InboundEvent, TelegramTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared handles the command dispatcher and the event loop both need.
pub struct AppContext {
    pub config: Arc<RwLock<MurmurConfig>>,
    pub config_path: PathBuf,
    pub store: Arc<ConversationStore>,
    pub forwarding: Arc<ForwardingMap>,
    pub transport: Arc<dyn Transport>,
    pub paused: Arc<AtomicBool>,
}

impl AppContext {
    /// Re-resolve every configured mapping off the command path; the
    /// acknowledgement never waits on network resolution.
    pub fn spawn_forwarding_rebuild(&self) {
        let forwarding = Arc::clone(&self.forwarding);
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let entries = config.read().await.forwarding.clone();
            let mapped = forwarding.rebuild(&entries, transport.as_ref()).await;
            tracing::info!(mapped, "forwarding map rebuilt");
        });
    }

    pub fn spawn_manual_drain(&self, conversation: ConversationId) {
        let transport = Arc::clone(&self.transport);
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let limit = config.read().await.agent.context_limit;
            let delivered =
                engine::deliver_manual(transport.as_ref(), &store, &conversation, limit).await;
            if delivered > 0 {
                tracing::info!(conversation = %conversation, delivered, "manual queue drained");
            }
        });
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, config_path) = MurmurConfig::load_with_path(config_path).await?;

    let transport: Arc<dyn Transport> =
        Arc::new(TelegramTransport::new(&cfg.telegram.bot_token)?);
    let generator = build_generator(&cfg);
    if generator.is_none() {
        tracing::warn!("no generation api key configured; replies are disabled");
    }

    let store = Arc::new(ConversationStore::new());
    let forwarding = Arc::new(ForwardingMap::new());
    let quiescence = Duration::from_millis(cfg.coalescer.quiescence_ms);
    let config = Arc::new(RwLock::new(cfg));

    let ctx = Arc::new(AppContext {
        config: Arc::clone(&config),
        config_path,
        store: Arc::clone(&store),
        forwarding: Arc::clone(&forwarding),
        transport: Arc::clone(&transport),
        paused: Arc::new(AtomicBool::new(false)),
    });

    {
        let entries = config.read().await.forwarding.clone();
        let mapped = forwarding.rebuild(&entries, transport.as_ref()).await;
        tracing::info!(mapped, configured = entries.len(), "forwarding map ready");
    }

    let coalescer = Arc::new(MediaGroupCoalescer::new(Arc::clone(&transport), quiescence));
    let engine = Arc::new(ReplyEngine::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::new(RwLock::new(generator)),
        Arc::clone(&config),
    ));

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<InboundEvent>(EVENT_CHANNEL_CAPACITY);

    let poll_task = {
        let transport = Arc::clone(&transport);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.start(tx).await {
                tracing::error!(%error, "transport loop exited");
            }
            shutdown.cancel();
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    tracing::info!("murmur is running");
    run_event_loop(ctx, coalescer, engine, rx, shutdown.clone()).await;

    poll_task.abort();
    tracing::info!("murmur stopped");
    Ok(())
}

async fn run_event_loop(
    ctx: Arc<AppContext>,
    coalescer: Arc<MediaGroupCoalescer>,
    engine: Arc<ReplyEngine>,
    mut rx: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_inbound(&ctx, &coalescer, &engine, event).await;
    }
}

async fn handle_inbound(
    ctx: &Arc<AppContext>,
    coalescer: &Arc<MediaGroupCoalescer>,
    engine: &Arc<ReplyEngine>,
    event: InboundEvent,
) {
    // Operator commands work even while paused; that is how pause is undone.
    if event.is_private && is_operator(ctx, &event).await {
        if let Some(parsed) = commands::parse(&event.text) {
            let response = match parsed {
                Parsed::Command(command) => commands::execute(ctx, command).await,
                Parsed::Usage(usage) => usage,
            };
            if let Err(error) = ctx
                .transport
                .send(&event.conversation_id, &response, None)
                .await
            {
                tracing::warn!(%error, "command response send failed");
            }
            return;
        }
    }

    if ctx.paused.load(Ordering::SeqCst) {
        return;
    }

    if let Some(destination) = ctx.forwarding.lookup(&event.conversation_id).await {
        coalescer
            .on_message(
                event.group_id.as_ref(),
                event.message_id.clone(),
                &event.conversation_id,
                &destination,
            )
            .await;
    }

    // Reply handling may pause for generation and typing; never hold up the
    // loop for it.
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        engine.handle_event(event).await;
    });
}

async fn is_operator(ctx: &AppContext, event: &InboundEvent) -> bool {
    let cfg = ctx.config.read().await;
    let sender = event.sender_id.as_str();
    sender == cfg.general.operator_id || cfg.general.admin_ids.iter().any(|id| id == sender)
}

fn build_generator(cfg: &MurmurConfig) -> Option<Arc<dyn Generator>> {
    let key = cfg.generation.api_key.trim();
    if key.is_empty() {
        return None;
    }
    Some(Arc::new(ChatClient::new(
        key,
        &cfg.generation.base_url,
        &cfg.generation.model,
    )))
}

/// Write a starter config if none exists; never overwrites.
pub async fn init(config_path: Option<PathBuf>) -> Result<PathBuf> {
    let path = config_path.unwrap_or_else(default_config_path);
    if tokio::fs::try_exists(&path)
        .await
        .with_context(|| format!("check {}", path.display()))?
    {
        return Ok(path);
    }
    let template = MurmurConfig::default();
    template.persist(&path).await?;
    Ok(path)
}

/// Validate the config and report what the process would start with.
pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = MurmurConfig::load_with_path(config_path).await?;
    println!("config: {} (valid)", path.display());
    println!("forwarding mappings: {}", cfg.forwarding.len());
    println!(
        "agent: enabled={} enrolled={} manual_mode={}",
        cfg.agent.enabled,
        cfg.agent.conversations.len(),
        cfg.agent.manual_mode
    );
    if cfg.generation.api_key.trim().is_empty() {
        println!("generation: NOT configured (replies disabled)");
    } else {
        println!(
            "generation: {} via {}",
            cfg.generation.model, cfg.generation.base_url
        );
    }
    Ok(())
}

/// One-shot send, useful for checking the token and a recipient reference.
pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = MurmurConfig::load(config_path).await?;
    let transport = TelegramTransport::new(&cfg.telegram.bot_token)?;
    let destination = transport.resolve(recipient).await?;
    transport
        .send(&ConversationId::from(destination.id.as_str()), message, None)
        .await?;
    println!("sent to {} ({})", destination.display_name, destination.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use async_trait::async_trait;
    use mm_transport::{Destination, MessageId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }

        async fn resolve(&self, reference: &str) -> Result<Destination> {
            Ok(Destination {
                id: reference.trim_start_matches('@').to_string(),
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
            _reply_to: Option<&MessageId>,
        ) -> Result<()> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((conversation.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn test_context() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = MurmurConfig::default();
        cfg.general.operator_id = "900".to_string();
        cfg.telegram.bot_token = "token".to_string();
        let ctx = Arc::new(AppContext {
            config: Arc::new(RwLock::new(cfg)),
            config_path: dir.path().join("config.toml"),
            store: Arc::new(ConversationStore::new()),
            forwarding: Arc::new(ForwardingMap::new()),
            transport: Arc::new(NullTransport::default()),
            paused: Arc::new(AtomicBool::new(false)),
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn pause_and_resume_flip_the_gate() {
        let (ctx, _dir) = test_context();
        assert!(!ctx.paused.load(Ordering::SeqCst));

        let ack = commands::execute(&ctx, Command::Pause).await;
        assert!(ack.contains("Paused"));
        assert!(ctx.paused.load(Ordering::SeqCst));

        commands::execute(&ctx, Command::Resume).await;
        assert!(!ctx.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listen_add_mutates_config_and_acknowledges() {
        let (ctx, _dir) = test_context();
        let ack = commands::execute(
            &ctx,
            Command::ListenAdd {
                source: "-100123".to_string(),
                destination: "@collector".to_string(),
            },
        )
        .await;
        assert!(ack.contains("-100123"));
        assert_eq!(ctx.config.read().await.forwarding.len(), 1);

        let ack = commands::execute(
            &ctx,
            Command::ListenAdd {
                source: "-100123".to_string(),
                destination: "not-a-destination".to_string(),
            },
        )
        .await;
        assert!(ack.contains("Rejected"));
        assert_eq!(ctx.config.read().await.forwarding.len(), 1);
    }

    #[tokio::test]
    async fn agent_resume_clears_only_suspended_conversations() {
        let (ctx, _dir) = test_context();
        let conversation = ConversationId::from("-100");
        ctx.store
            .trigger_alert(&conversation, "bot", "bot?", "Ann", chrono::Utc::now());

        let ack = commands::execute(
            &ctx,
            Command::AgentResume {
                conversation: "-100".to_string(),
            },
        )
        .await;
        assert!(ack.contains("re-armed"));
        assert!(!ctx.store.is_suspended(&conversation));

        let ack = commands::execute(
            &ctx,
            Command::AgentResume {
                conversation: "-100".to_string(),
            },
        )
        .await;
        assert!(ack.contains("not suspended"));
    }

    #[tokio::test]
    async fn status_reports_the_live_tunables() {
        let (ctx, _dir) = test_context();
        commands::execute(&ctx, Command::AgentProbability(55)).await;
        let status = commands::execute(&ctx, Command::Status).await;
        assert!(status.contains("reply_probability=55%"));
        assert!(status.contains("paused=false"));
        assert!(status.contains("suspended=none"));
    }

    #[tokio::test]
    async fn init_is_idempotent_and_never_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let written = init(Some(path.clone())).await.expect("first init");
        assert_eq!(written, path);
        let first = tokio::fs::read_to_string(&path).await.expect("read");

        tokio::fs::write(&path, "# operator edits\n")
            .await
            .expect("edit");
        init(Some(path.clone())).await.expect("second init");
        let second = tokio::fs::read_to_string(&path).await.expect("reread");
        assert_eq!(second, "# operator edits\n");
        assert_ne!(first, second);
    }
}
