//! Handlers for the smaller subcommands — everything except `gateway`,
//! which lives in `gateway_service.rs` since it composes the whole
//! runtime. Grounded on the teacher's `subcommands.rs` (one function per
//! leaf command, printing human-readable status lines to stdout).

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::agent::AgentRequest;
use crate::backup;
use crate::cli::{BackupCommands, CronCommands, PairingCommands};
use crate::cli::gateway_service::build_agent_stack;
use crate::config::loader::{clawlite_home, default_config_path, load_config};
use crate::cron::CronStore;
use crate::trust::PairingStore;

pub async fn agent_command(message: String, session: String) -> Result<()> {
    let cfg = load_config(&default_config_path())?;
    let (agent, _sessions, _memory) = build_agent_stack(&cfg)?;
    let req = AgentRequest { prompt: message, session_id: session, skill: None, identity: "cli".to_string(), can_execute_tools: true };
    match agent.run(req).await {
        Ok((text, meta)) => {
            println!("{text}");
            if meta.tokens > 0 {
                eprintln!("[{} tokens, ${:.4}]", meta.tokens, meta.estimated_cost_usd);
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            Err(anyhow::anyhow!(err.to_string()))
        }
    }
}

pub async fn cron_command(cmd: CronCommands) -> Result<()> {
    let home = clawlite_home();
    let store = CronStore::new(&home).context("abrindo armazenamento de cron")?;
    match cmd {
        CronCommands::List => {
            let jobs = store.list_jobs()?;
            if jobs.is_empty() {
                println!("nenhum job de cron cadastrado.");
            }
            for job in jobs {
                println!("#{} [{}] {} a cada {}s -> {}/{}", job.id, if job.enabled { "on" } else { "off" }, job.name, job.interval_seconds, job.channel, job.chat_id);
            }
        }
        CronCommands::Add { channel, chat_id, thread_id, label, name, text, interval_seconds } => {
            let id = store.add_job(&channel, &chat_id, &thread_id, &label, &name, &text, interval_seconds, true)?;
            println!("job de cron #{id} criado.");
        }
        CronCommands::Remove { id } => {
            if store.remove_job(id)? {
                println!("job #{id} removido.");
            } else {
                println!("job #{id} não encontrado.");
            }
        }
        CronCommands::Run { id } => {
            let store = Arc::new(store);
            let queue = Arc::new(crate::queue::QueueStore::new(&home)?);
            let notifications = Arc::new(crate::notifications::NotificationStore::new(&home)?);
            let marketplace = Arc::new(crate::marketplace::MarketplaceStore::new(&home));
            let handler = Arc::new(crate::marketplace::MarketplaceAutoUpdateHandler::new(marketplace));
            let scheduler = crate::cron::CronScheduler::new(store, queue, notifications, handler);
            let results = match id {
                Some(job_id) => scheduler.run_one(job_id).await?,
                None => scheduler.run_all().await?,
            };
            println!("{} job(s) executado(s).", results.len());
        }
    }
    Ok(())
}

pub fn pairing_command(cmd: PairingCommands) -> Result<()> {
    let home = clawlite_home();
    let store = PairingStore::new(home.join("pairing.json"));
    match cmd {
        PairingCommands::Approve { channel, code, client_key } => match store.approve(&channel, &code, &client_key)? {
            Some(req) => println!("aprovado: {} ({})", req.display, req.peer_id),
            None => println!("código não encontrado ou expirado."),
        },
        PairingCommands::Reject { channel, code } => {
            if store.reject(&channel, &code)? {
                println!("pedido de pareamento rejeitado.");
            } else {
                println!("código não encontrado ou expirado.");
            }
        }
    }
    Ok(())
}

pub fn backup_command(cmd: BackupCommands) -> Result<()> {
    let home = clawlite_home();
    match cmd {
        BackupCommands::Create { label, keep_last } => {
            let report = backup::create_backup(&home, &label, keep_last)?;
            println!("backup criado: {} ({} bytes, {} entradas)", report.archive.display(), report.size_bytes, report.entries.len());
        }
        BackupCommands::List => {
            let listings = backup::list_backups(&home)?;
            if listings.is_empty() {
                println!("nenhum backup encontrado.");
            }
            for listing in listings {
                println!("{}  {} bytes  {}", listing.modified_at, listing.size_bytes, listing.name);
            }
        }
        BackupCommands::Restore { archive } => {
            let report = backup::restore_backup(std::path::Path::new(&archive), &home)?;
            println!("backup restaurado em {}: {} entradas.", report.target_dir.display(), report.restored_entries.len());
        }
    }
    Ok(())
}

pub fn status_command() -> Result<()> {
    let cfg = load_config(&default_config_path())?;
    println!("modelo: {}", cfg.model);
    println!("gateway: {}:{}", cfg.gateway.host, cfg.gateway.port);
    println!("modo offline: {}", cfg.offline_mode.enabled);
    let channel_flags = [
        ("telegram", cfg.channels.telegram.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("discord", cfg.channels.discord.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("slack", cfg.channels.slack.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("whatsapp", cfg.channels.whatsapp.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("irc", cfg.channels.irc.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("googlechat", cfg.channels.googlechat.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("signal", cfg.channels.signal.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
        ("imessage", cfg.channels.imessage.as_ref().map(|c| c.base.enabled).unwrap_or(false)),
    ];
    for (name, enabled) in channel_flags {
        if enabled {
            println!("canal ativo: {name}");
        }
    }
    Ok(())
}
