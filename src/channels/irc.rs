//! IRC adapter: raw TCP line protocol (`PRIVMSG`), no IRC framework crate
//! in the teacher's stack to lean on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::InboundMessage;
use crate::channels::base::{BaseChannel, Health};
use crate::channels::session_id;
use crate::resilience::{CircuitState, OutboundResilience, OutboundResilienceConfig};

pub struct IrcChannel {
    server: String,
    port: u16,
    nick: String,
    channels: Vec<String>,
    inbound: tokio::sync::mpsc::Sender<InboundMessage>,
    writer: Arc<Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>>,
    resilience: Arc<Mutex<OutboundResilience>>,
    running: Arc<AtomicBool>,
    read_task: Option<JoinHandle<()>>,
}

impl IrcChannel {
    pub fn new(server: String, port: u16, nick: String, channels: Vec<String>, inbound: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        IrcChannel {
            server,
            port,
            nick,
            channels,
            inbound,
            writer: Arc::new(Mutex::new(None)),
            resilience: Arc::new(Mutex::new(OutboundResilience::new("irc", OutboundResilienceConfig::default()))),
            running: Arc::new(AtomicBool::new(false)),
            read_task: None,
        }
    }
}

fn parse_privmsg(line: &str) -> Option<(String, String, String)> {
    // :nick!user@host PRIVMSG #channel :text
    let line = line.strip_prefix(':')?;
    let (prefix, rest) = line.split_once(' ')?;
    let nick = prefix.split('!').next()?.to_string();
    let rest = rest.strip_prefix("PRIVMSG ")?;
    let (target, text) = rest.split_once(" :")?;
    Some((nick, target.to_string(), text.trim_end_matches(['\r', '\n']).to_string()))
}

#[async_trait]
impl BaseChannel for IrcChannel {
    fn name(&self) -> &str {
        "irc"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let stream = TcpStream::connect((self.server.as_str(), self.port)).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half.write_all(format!("NICK {}\r\n", self.nick).as_bytes()).await?;
        write_half.write_all(format!("USER {} 0 * :{}\r\n", self.nick, self.nick).as_bytes()).await?;
        for channel in &self.channels {
            write_half.write_all(format!("JOIN {channel}\r\n").as_bytes()).await?;
        }

        *self.writer.lock().await = Some(write_half);
        self.running.store(true, Ordering::SeqCst);

        let inbound = self.inbound.clone();
        let running = self.running.clone();
        let writer = self.writer.clone();
        self.read_task = Some(tokio::spawn(async move {
            let mut reader = BufReader::new(read_half).lines();
            while running.load(Ordering::SeqCst) {
                let Ok(Some(line)) = reader.next_line().await else { break };
                if let Some(rest) = line.strip_prefix("PING ") {
                    if let Some(w) = writer.lock().await.as_mut() {
                        let _ = w.write_all(format!("PONG {rest}\r\n").as_bytes()).await;
                    }
                    continue;
                }
                if let Some((nick, target, text)) = parse_privmsg(&line) {
                    let is_dm = !target.starts_with('#');
                    let msg = InboundMessage {
                        session_id: session_id::irc(is_dm, if is_dm { &nick } else { &target }),
                        channel: "irc".to_string(),
                        sender_id: nick,
                        text,
                        thread_id: None,
                        is_dm,
                        metadata: serde_json::json!({ "target": target }),
                    };
                    let _ = inbound.send(msg).await;
                }
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        *self.writer.lock().await = None;
        Ok(())
    }

    async fn send(&mut self, target: &str, text: &str, _metadata: Option<Value>) -> anyhow::Result<()> {
        let writer = self.writer.clone();
        let target = target.to_string();
        let text = text.to_string();
        let mut resilience = self.resilience.lock().await;
        let result = resilience
            .deliver(&target, &text, "irc_privmsg", || {
                let writer = writer.clone();
                let target = target.clone();
                let text = text.clone();
                async move {
                    let mut guard = writer.lock().await;
                    let Some(w) = guard.as_mut() else { return Err("not connected".to_string()) };
                    w.write_all(format!("PRIVMSG {target} :{text}\r\n").as_bytes())
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await;
        if !result.ok {
            anyhow::bail!(result.error.map(|e| e.reason).unwrap_or_default());
        }
        Ok(())
    }

    fn health(&self) -> Health {
        Health { running: self.running.load(Ordering::SeqCst), detail: "irc tcp".to_string() }
    }

    fn outbound_metrics_snapshot(&self) -> crate::resilience::OutboundMetrics {
        self.resilience.try_lock().map(|r| r.metrics().clone()).unwrap_or_default()
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilience.try_lock().map(|r| r.circuit_state()).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_privmsg() {
        let (nick, target, text) = parse_privmsg(":alice!~a@host PRIVMSG #general :hello world\r\n").unwrap();
        assert_eq!(nick, "alice");
        assert_eq!(target, "#general");
        assert_eq!(text, "hello world");
    }

    #[test]
    fn parses_direct_message() {
        let (nick, target, text) = parse_privmsg(":bob!~b@host PRIVMSG clawlite :oi\r\n").unwrap();
        assert_eq!(nick, "bob");
        assert_eq!(target, "clawlite");
        assert_eq!(text, "oi");
    }
}
