use std::path::PathBuf;

use super::SupervisorState;

/// Errors that abort a launch or the wait on its outcome.
///
/// Everything else that can go wrong around a run (script hygiene, stale
/// log deletion, unparsable output) is deliberately a logged warning, not
/// an error: telemetry failures must never interrupt an installation.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a script invocation is already active (state: {0:?})")]
    AlreadyLaunched(SupervisorState),

    #[error("install script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("failed to spawn install script {script}: {source}")]
    SpawnFailed {
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error("script process produced no readable stdout handle")]
    MissingStdout,

    #[error("supervisor background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
