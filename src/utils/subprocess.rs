//! Environment scrubbing for subprocess execution.
//!
//! Worker commands and tool-invoked shells must not inherit provider tokens
//! or gateway secrets from this process's environment. We clear the child's
//! environment entirely and re-admit an explicit allowlist.

use std::process::Command;

const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "LANG", "LC_ALL", "TERM", "TMPDIR", "USER", "SHELL",
];

/// Builds a `Command` with a scrubbed environment: only variables named in
/// `ALLOWED_ENV_VARS` survive from the parent process.
pub fn scrubbed_command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    for key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

/// Tokio-async equivalent of [`scrubbed_command`], for call sites already
/// running on the async executor (worker loop, local model execution).
pub fn scrubbed_tokio_command(program: &str, args: &[String]) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    for key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_command_drops_unlisted_vars() {
        unsafe { std::env::set_var("CLAWLITE_SECRET_TEST", "should-not-leak"); }
        let cmd = scrubbed_command("/bin/true", &[]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(!envs.iter().any(|(k, _)| *k == "CLAWLITE_SECRET_TEST"));
        unsafe { std::env::remove_var("CLAWLITE_SECRET_TEST"); }
    }

    #[test]
    fn scrubbed_command_keeps_allowlisted_path() {
        unsafe { std::env::set_var("PATH", "/usr/bin:/bin"); }
        let cmd = scrubbed_command("/bin/true", &[]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.iter().any(|(k, v)| *k == "PATH" && v.is_some()));
    }
}
