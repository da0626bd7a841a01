use crate::utils::error::{AgentError, Result};

/// Detaches from the controlling terminal: forks, starts a new session and
/// changes to `/`. Standard streams go to `/dev/null` unless `keep_stderr`.
///
/// Must run before any tokio runtime or thread is started.
pub fn daemonize(keep_stderr: bool) -> Result<()> {
    nix::unistd::daemon(false, keep_stderr)
        .map_err(|errno| AgentError::DaemonizeError(errno.to_string()))
}
