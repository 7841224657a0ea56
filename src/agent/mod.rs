pub mod compaction;
pub mod context;
#[path = "loop.rs"]
pub mod agent_loop;
pub mod subagent;
pub mod tools;
pub mod workspace;

pub use agent_loop::{AgentLoop, AgentMeta, AgentRequest};
pub use subagent::{SubagentManager, SubagentNotifier, SubagentRun, SubagentStatus};
pub use workspace::Workspace;
