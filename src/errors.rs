//! Crate-wide error hierarchy.
//!
//! Module boundaries return `ClawLiteError`; leaf code that has no reason to
//! distinguish a failure mode keeps using `anyhow::Result` and relies on the
//! `Internal` variant to cross into the typed boundary with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClawLiteError {
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("provider timed out after {attempts} attempt(s)")]
    ProviderTimeout { attempts: u32 },

    #[error("provider send failed: {reason}")]
    ProviderSendFailed { reason: String },

    #[error("circuit open for {channel}, cooldown remaining {remaining_s:.1}s")]
    CircuitOpen { channel: String, remaining_s: f64 },

    #[error("provider execution failed: {0}")]
    ProviderExecution(String),

    #[error("ollama execution failed: {0}")]
    OllamaExecution(String),

    #[error("codex execution failed: {0}")]
    CodexExecution(String),

    #[error("tool blocked by policy: {policy}")]
    ToolDenied { policy: String },

    #[error("skill marketplace error: {0}")]
    SkillMarketplace(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(i64),

    #[error("cron job not found: {0}")]
    CronJobNotFound(i64),

    #[error("pairing code not found or expired")]
    PairingNotFound,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClawLiteError>;

impl ClawLiteError {
    /// Short user-facing message for channel replies, matching the
    /// runtime's habit of translating failures into terse apology text.
    pub fn user_message(&self) -> String {
        match self {
            ClawLiteError::ChannelUnavailable(_) => "Canal indisponível no momento.".to_string(),
            ClawLiteError::ProviderTimeout { .. } => "O provedor demorou demais para responder.".to_string(),
            ClawLiteError::ProviderSendFailed { .. } => "Falha ao enviar a mensagem.".to_string(),
            ClawLiteError::CircuitOpen { .. } => "Canal temporariamente suspenso após falhas consecutivas.".to_string(),
            ClawLiteError::ProviderExecution(_) => "Falha ao consultar o modelo.".to_string(),
            ClawLiteError::OllamaExecution(_) => "Falha ao executar o modelo local.".to_string(),
            ClawLiteError::CodexExecution(_) => "Falha na sessão do Codex.".to_string(),
            ClawLiteError::ToolDenied { policy } => format!("Ferramenta bloqueada: {policy}"),
            ClawLiteError::SkillMarketplace(_) => "Falha ao instalar/atualizar skill.".to_string(),
            ClawLiteError::Backup(_) => "Falha ao gerar backup.".to_string(),
            ClawLiteError::WorkerNotFound(_) => "Worker não encontrado.".to_string(),
            ClawLiteError::CronJobNotFound(_) => "Job de cron não encontrado.".to_string(),
            ClawLiteError::PairingNotFound => "Código de pareamento inválido ou expirado.".to_string(),
            ClawLiteError::InvalidConfig(_) => "Configuração inválida.".to_string(),
            ClawLiteError::Database(_) | ClawLiteError::Io(_) | ClawLiteError::Json(_) | ClawLiteError::Internal(_) => {
                "Erro interno inesperado.".to_string()
            }
        }
    }

    /// Failure taxonomy code used in structured logs and metrics, per the
    /// channel/provider error codes named in the runtime's error design.
    pub fn code(&self) -> &'static str {
        match self {
            ClawLiteError::ChannelUnavailable(_) => "channel_unavailable",
            ClawLiteError::ProviderTimeout { .. } => "provider_timeout",
            ClawLiteError::ProviderSendFailed { .. } => "provider_send_failed",
            ClawLiteError::CircuitOpen { .. } => "circuit_open",
            ClawLiteError::ProviderExecution(_) => "provider_execution_error",
            ClawLiteError::OllamaExecution(_) => "ollama_execution_error",
            ClawLiteError::CodexExecution(_) => "codex_execution_error",
            ClawLiteError::ToolDenied { .. } => "tool_denied",
            ClawLiteError::SkillMarketplace(_) => "skill_marketplace_error",
            ClawLiteError::Backup(_) => "backup_error",
            ClawLiteError::WorkerNotFound(_) => "worker_not_found",
            ClawLiteError::CronJobNotFound(_) => "cron_job_not_found",
            ClawLiteError::PairingNotFound => "pairing_not_found",
            ClawLiteError::InvalidConfig(_) => "invalid_config",
            ClawLiteError::Database(_) => "database_error",
            ClawLiteError::Io(_) => "io_error",
            ClawLiteError::Json(_) => "json_error",
            ClawLiteError::Internal(_) => "internal_error",
        }
    }
}
