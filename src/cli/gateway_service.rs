//! The `gateway` subcommand's autonomy-runtime composition: wires config,
//! provider, agent stack, channel adapters, cron, heartbeat, queue worker
//! recovery, and the HTTP surface into one running process. Grounded on
//! the teacher's `cli/commands/mod.rs::gateway()` (load config → build
//! provider → warmup → message bus → cron → agent → heartbeat → HTTP
//! server → channels → `tokio::select!` shutdown), generalized since this
//! crate's `AgentLoop` answers one request at a time instead of running
//! its own internal consumer loop — so this module owns that consumer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::agent::tools::builtin::{ExecCmdTool, MemorySearchTool, ReadFileTool, WriteFileTool};
use crate::agent::tools::ToolRegistry;
use crate::agent::{AgentLoop, AgentRequest, Workspace};
use crate::bus::MessageBus;
use crate::channels::manager::ChannelManager;
use crate::config::loader::{clawlite_home, default_config_path, load_config};
use crate::config::Config;
use crate::cron::{CronScheduler, CronStore};
use crate::gateway::{self, GatewayState};
use crate::heartbeat::{HeartbeatAgent, HeartbeatLoop, ProactiveSink, TelegramProactiveSink};
use crate::marketplace::{MarketplaceAutoUpdateHandler, MarketplaceStore};
use crate::memory::MemoryStore;
use crate::notifications::NotificationStore;
use crate::providers::{build_chat_provider, get_model_or_default, ChatFallbackProvider, LLMProvider};
use crate::queue::QueueStore;
use crate::session::SessionStore;
use crate::trust::policy::{ToolPolicy, ToolPolicyEngine};
use crate::trust::PairingStore;

fn provider_token(cfg: &Config, spec_env_vars: &[&str], provider: &str) -> String {
    for var in spec_env_vars {
        if let Ok(v) = std::env::var(var) {
            if !v.trim().is_empty() {
                return v.trim().to_string();
            }
        }
    }
    cfg.auth.providers.get(provider).map(|p| p.token.clone()).unwrap_or_default()
}

pub fn build_tool_registry(workspace_root: &std::path::Path, memory: Arc<MemoryStore>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(ReadFileTool::new(workspace_root.to_path_buf())));
    tools.register(Arc::new(WriteFileTool::new(workspace_root.to_path_buf())));
    tools.register(Arc::new(ExecCmdTool));
    tools.register(Arc::new(MemorySearchTool::new(memory)));
    tools
}

pub fn build_policy_engine(cfg: &Config) -> ToolPolicyEngine {
    let explicit: HashMap<String, ToolPolicy> = cfg.security.tool_policies.iter().filter_map(|(k, v)| ToolPolicy::parse(v).map(|p| (k.clone(), p))).collect();
    ToolPolicyEngine::new(explicit)
}

/// Builds the `AgentLoop` plus the session/memory stores it shares with the
/// rest of the autonomy stack, so the `agent` one-shot command and the
/// `gateway` command start from the same seam.
pub fn build_agent_stack(cfg: &Config) -> Result<(Arc<AgentLoop>, Arc<SessionStore>, Arc<MemoryStore>)> {
    let home = clawlite_home();
    let workspace = Workspace::new(home.join("workspace"));
    let sessions = Arc::new(SessionStore::new(&home).context("opening session store")?);
    let memory = Arc::new(MemoryStore::new(&home).context("opening memory store")?);
    let tools = Arc::new(build_tool_registry(workspace.root(), memory.clone()));
    let policy = build_policy_engine(cfg);

    let entry = get_model_or_default(&cfg.model);
    let spec = crate::providers::provider_spec(&entry.provider);
    let env_vars: &[&str] = spec.map(|s| s.env_vars).unwrap_or(&[]);
    let token = provider_token(cfg, env_vars, &entry.provider);
    let provider = build_chat_provider(&entry.provider, token, entry.id.clone())
        .ok_or_else(|| anyhow::anyhow!("nenhum provedor de chat disponível para o modelo {}", cfg.model))?;
    let provider: Arc<dyn LLMProvider> = Arc::new(ChatFallbackProvider::new(Arc::new(cfg.clone()), cfg.model.clone(), provider));

    let agent = Arc::new(AgentLoop::new(workspace, sessions.clone(), memory.clone(), tools, provider, policy, cfg.model.clone()));
    Ok((agent, sessions, memory))
}

/// Bridges `AgentLoop`'s async `run` to the heartbeat loop's sync
/// `decide`/`execute` seam, the same way `MarketplaceAutoUpdateHandler`
/// bridges `SystemJobHandler` — `block_in_place` is safe here because the
/// multi-threaded `tokio::full` runtime always has spare worker threads.
struct AgentHeartbeatBridge {
    agent: Arc<AgentLoop>,
    session_id: String,
}

impl HeartbeatAgent for AgentHeartbeatBridge {
    fn decide(&self, heartbeat_md: &str) -> Result<String, String> {
        self.run_sync(&format!(
            "Com base no HEARTBEAT.md abaixo, responda apenas com JSON {{\"action\":\"run\"|\"skip\",\"tasks\":\"...\"}}.\n\n{heartbeat_md}"
        ))
    }

    fn execute(&self, prompt: &str) -> Result<String, String> {
        self.run_sync(prompt)
    }
}

impl AgentHeartbeatBridge {
    fn run_sync(&self, prompt: &str) -> Result<String, String> {
        let agent = self.agent.clone();
        let req = AgentRequest { prompt: prompt.to_string(), session_id: self.session_id.clone(), skill: None, identity: "heartbeat".to_string(), can_execute_tools: true };
        let result = tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(agent.run(req)));
        match result {
            Ok((text, _meta)) => Ok(text),
            Err(err) => Err(err.to_string()),
        }
    }
}

struct ChannelManagerProactiveSink {
    channels: Arc<ChannelManager>,
    fallback_chat_ids: HashMap<String, String>,
}

#[async_trait::async_trait]
impl ProactiveSink for ChannelManagerProactiveSink {
    async fn send(&self, message: &str) -> Result<(), String> {
        let report = self.channels.broadcast_proactive(message, "[heartbeat] ", &self.fallback_chat_ids).await;
        if report.delivered == 0 && report.failed > 0 {
            return Err("todas as entregas proativas falharam".to_string());
        }
        Ok(())
    }
}

fn fallback_chat_ids(cfg: &Config) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let pairs: [(&str, Option<&crate::config::schema::ChannelBase>); 6] = [
        ("telegram", cfg.channels.telegram.as_ref().map(|c| &c.base)),
        ("discord", cfg.channels.discord.as_ref().map(|c| &c.base)),
        ("slack", cfg.channels.slack.as_ref().map(|c| &c.base)),
        ("whatsapp", cfg.channels.whatsapp.as_ref().map(|c| &c.base)),
        ("irc", cfg.channels.irc.as_ref().map(|c| &c.base)),
        ("googlechat", cfg.channels.googlechat.as_ref().map(|c| &c.base)),
    ];
    for (name, base) in pairs {
        if let Some(base) = base {
            if let Some(chat_id) = &base.chat_id {
                map.insert(name.to_string(), chat_id.clone());
            }
        }
    }
    map
}

async fn register_channels(channels: &ChannelManager, cfg: &Config, inbound_tx: tokio::sync::mpsc::Sender<crate::bus::InboundMessage>) {
    #[cfg(feature = "channel-telegram")]
    if let Some(tg) = cfg.channels.telegram.as_ref().filter(|c| c.base.enabled) {
        channels.register("telegram".to_string(), "telegram".to_string(), Box::new(crate::channels::telegram::TelegramChannel::new(tg.base.token.clone(), inbound_tx.clone()))).await;
    }
    #[cfg(feature = "channel-discord")]
    if let Some(dc) = cfg.channels.discord.as_ref().filter(|c| c.base.enabled) {
        channels
            .register("discord".to_string(), "discord".to_string(), Box::new(crate::channels::discord::DiscordChannel::new(dc.base.token.clone(), dc.base.allow_channels.clone(), inbound_tx.clone())))
            .await;
    }
    #[cfg(feature = "channel-slack")]
    if let Some(sl) = cfg.channels.slack.as_ref().filter(|c| c.base.enabled) {
        channels.register("slack".to_string(), "slack".to_string(), Box::new(crate::channels::slack::SlackChannel::new(sl.base.token.clone(), sl.base.allow_channels.clone(), inbound_tx.clone()))).await;
    }
    #[cfg(feature = "channel-whatsapp")]
    if let Some(wa) = cfg.channels.whatsapp.as_ref().filter(|c| c.base.enabled) {
        let phone_number_id = wa.base.chat_id.clone().unwrap_or_default();
        channels.register("whatsapp".to_string(), "whatsapp".to_string(), Box::new(crate::channels::whatsapp::WhatsAppChannel::new(wa.base.token.clone(), phone_number_id))).await;
    }
    if let Some(gc) = cfg.channels.googlechat.as_ref().filter(|c| c.base.enabled) {
        channels.register("googlechat".to_string(), "googlechat".to_string(), Box::new(crate::channels::googlechat::GoogleChatChannel::new(gc.base.token.clone()))).await;
    }
    #[cfg(feature = "channel-irc")]
    if let Some(irc) = cfg.channels.irc.as_ref().filter(|c| c.base.enabled) {
        let (server, port) = irc.base.token.split_once(':').map(|(h, p)| (h.to_string(), p.parse().unwrap_or(6667))).unwrap_or((irc.base.token.clone(), 6667));
        let nick = irc.base.chat_id.clone().unwrap_or_else(|| "clawlite".to_string());
        channels.register("irc".to_string(), "irc".to_string(), Box::new(crate::channels::irc::IrcChannel::new(server, port, nick, irc.base.allow_channels.clone(), inbound_tx.clone()))).await;
    }
    if cfg.channels.signal.as_ref().is_some_and(|c| c.base.enabled) {
        let transport = crate::channels::webhook_bridge::OutboundTransport::LocalCli { cli_path: "signal-cli".to_string(), extra_args: vec!["send".to_string()] };
        channels.register("signal".to_string(), "signal".to_string(), Box::new(crate::channels::webhook_bridge::WebhookBridgeChannel::new("signal", transport))).await;
    }
    if cfg.channels.imessage.as_ref().is_some_and(|c| c.base.enabled) {
        let transport = crate::channels::webhook_bridge::OutboundTransport::LocalCli { cli_path: "imsg".to_string(), extra_args: Vec::new() };
        channels.register("imessage".to_string(), "imessage".to_string(), Box::new(crate::channels::webhook_bridge::WebhookBridgeChannel::new("imessage", transport))).await;
    }
}

/// Spawns the task that drains the inbound bus, runs each message through
/// the agent loop, and routes the reply back out through the channel that
/// sent it — the piece the teacher gets for free from its own internal
/// `AgentLoop::run()` consumer loop.
fn start_inbound_consumer(mut bus: MessageBus, agent: Arc<AgentLoop>, channels: Arc<ChannelManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = bus.recv().await {
            let channel = msg.channel.clone();
            let target = msg.metadata.get("chat_id").and_then(|v| v.as_str()).unwrap_or(&msg.sender_id).to_string();
            let req = AgentRequest { prompt: msg.text, session_id: msg.session_id, skill: None, identity: msg.sender_id, can_execute_tools: true };
            match agent.run(req).await {
                Ok((text, _meta)) => {
                    if let Err(err) = channels.send(&channel, &target, &text, None).await {
                        warn!(channel = %channel, error = %err, "falha ao entregar resposta do agente");
                    }
                }
                Err(err) => {
                    warn!(channel = %channel, error = %err.user_message(), "agent loop falhou ao processar mensagem recebida");
                }
            }
        }
    })
}

fn spawn_worker_recovery(queue: Arc<QueueStore>, cfg: Arc<Config>) {
    let workers = match queue.workers_needing_recovery() {
        Ok(w) => w,
        Err(err) => {
            warn!(error = %err, "falha ao listar workers para recuperação");
            return;
        }
    };
    for worker in workers {
        let queue = queue.clone();
        let cfg = cfg.clone();
        let pid = std::process::id() as i32;
        tokio::spawn(async move {
            info!(worker_id = worker.id, "recuperando worker de fila");
            if let Err(err) = crate::queue::worker::worker_loop(&queue, worker.id, &cfg, pid).await {
                warn!(worker_id = worker.id, error = %err, "worker de fila encerrou com erro");
            }
        });
    }
}

pub async fn run() -> Result<()> {
    info!("carregando configuração...");
    let config_path = default_config_path();
    let config = Arc::new(load_config(&config_path)?);
    let home = clawlite_home();

    let (agent, _sessions, _memory) = build_agent_stack(&config)?;
    info!(model = %config.model, "stack do agente pronto");

    let bus = MessageBus::new(256);
    let inbound_tx = bus.sender();

    let channels = Arc::new(ChannelManager::new());
    register_channels(&channels, &config, inbound_tx.clone()).await;

    let cron_store = Arc::new(CronStore::new(&home)?);
    let queue_store = Arc::new(QueueStore::new(&home)?);
    let notifications = Arc::new(NotificationStore::new(&home)?);
    let pairing = Arc::new(PairingStore::new(home.join("pairing.json")));
    let marketplace = Arc::new(MarketplaceStore::new(&home));
    let system_job_handler = Arc::new(MarketplaceAutoUpdateHandler::new(marketplace));

    let cron_scheduler = Arc::new(
        CronScheduler::new(cron_store.clone(), queue_store.clone(), notifications.clone(), system_job_handler)
            .with_poll_interval_secs(config.gateway.cron_poll_interval_s as f64),
    );

    let proactive: Arc<dyn ProactiveSink> = match TelegramProactiveSink::from_config(&config) {
        Some(sink) => Arc::new(sink),
        None => Arc::new(ChannelManagerProactiveSink { channels: channels.clone(), fallback_chat_ids: fallback_chat_ids(&config) }),
    };
    let heartbeat_agent: Arc<dyn HeartbeatAgent> = Arc::new(AgentHeartbeatBridge { agent: agent.clone(), session_id: "heartbeat:local".to_string() });
    let heartbeat = Arc::new(
        HeartbeatLoop::new(home.join("workspace"), heartbeat_agent, notifications.clone(), proactive).with_interval_secs(config.gateway.heartbeat_interval_s),
    );

    let gateway_state = GatewayState::new(config.clone(), channels.clone(), cron_store.clone(), pairing, queue_store.clone(), inbound_tx);
    let (_http_task, _gateway_state) = gateway::start(&config.gateway.host, config.gateway.port, gateway_state).await?;

    channels.start_all().await?;
    spawn_worker_recovery(queue_store, config.clone());

    println!("clawlite gateway ouvindo em {}:{}", config.gateway.host, config.gateway.port);

    let cron_task = {
        let cron_scheduler = cron_scheduler.clone();
        let cfg = config.clone();
        tokio::spawn(async move { cron_scheduler.run(&cfg).await })
    };
    let heartbeat_task = {
        let heartbeat = heartbeat.clone();
        let cfg = config.clone();
        tokio::spawn(async move { heartbeat.run(&cfg).await })
    };
    let consumer_task = start_inbound_consumer(bus, agent, channels.clone());

    info!("todos os serviços iniciados, gateway em execução");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nencerrando...");
            heartbeat.stop();
            cron_scheduler.stop();
            channels.stop_all().await;
        }
        _ = consumer_task => {}
        _ = cron_task => {}
        _ = heartbeat_task => {}
    }

    Ok(())
}
