//! Raw-line sources for supervised script output.
//!
//! Two ways of getting lines out of the script: a direct pipe on its stdout,
//! or tailing the log file a shell wrapper redirects into. Both run as
//! background tasks and hand lines to the consumer over a single-consumer
//! channel, so ordering is preserved and the foreground never touches the
//! reader state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Pause between polls of the log file while the script is still running.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff used while the log file does not exist yet, and after a
/// transient read failure.
pub const OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Strip the trailing newline (and a preceding carriage return) from a
/// freshly read line.
pub(crate) fn normalize_line(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

/// Read lines from the child's piped stdout until EOF, forwarding each one.
///
/// Lines arrive as the script flushes them; the task ends when the pipe
/// closes (every writer of it has exited) or the receiver goes away.
pub fn spawn_pipe_reader(stdout: ChildStdout, tx: UnboundedSender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(normalize_line(std::mem::take(&mut line))).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("error reading script stdout: {err}");
                    break;
                }
            }
        }
        trace!("pipe reader finished");
    })
}

/// Tail the log file the shell-redirect strategy writes into.
///
/// The file usually does not exist when the task starts, so opening retries
/// every [`OPEN_RETRY_INTERVAL`]. Once open the handle is held for the rest
/// of the run. Each poll drains every complete line currently in the file;
/// a partially written tail is buffered across polls rather than split.
/// After `exited` is observed one more drain pass runs to catch output
/// written in the observation gap, then the task ends.
pub fn spawn_file_poller(
    path: PathBuf,
    exited: Arc<AtomicBool>,
    tx: UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(file) = open_with_retry(&path, &exited).await else {
            trace!(path = %path.display(), "script exited before its log file appeared");
            return;
        };

        let mut reader = BufReader::new(file);
        let mut pending = String::new();
        loop {
            let exit_seen = exited.load(Ordering::SeqCst);
            if let Err(err) = drain_available(&mut reader, &mut pending, &tx).await {
                warn!(path = %path.display(), "transient failure reading script log: {err}");
                tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                continue;
            }
            if exit_seen || tx.is_closed() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        // a final partial line without a newline still counts once the
        // script is gone
        if !pending.is_empty() {
            let _ = tx.send(std::mem::take(&mut pending));
        }
        trace!("file poller finished");
    })
}

async fn open_with_retry(path: &Path, exited: &AtomicBool) -> Option<File> {
    loop {
        match File::open(path).await {
            Ok(file) => return Some(file),
            Err(err) => {
                trace!(path = %path.display(), "waiting for script log file: {err}");
            }
        }
        if exited.load(Ordering::SeqCst) {
            // the script may have created the file just before exiting
            return File::open(path).await.ok();
        }
        tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
    }
}

/// Forward every complete line currently available from the reader.
///
/// `read_line` hands back whatever is at the end of the file even without a
/// trailing newline, so incomplete tails are accumulated in `pending` until
/// the newline shows up on a later poll.
async fn drain_available<R>(
    reader: &mut BufReader<R>,
    pending: &mut String,
    tx: &UnboundedSender<String>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = String::new();
    loop {
        chunk.clear();
        let read = reader.read_line(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        pending.push_str(&chunk);
        if pending.ends_with('\n') {
            let line = normalize_line(std::mem::take(pending));
            if tx.send(line).is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    #[test]
    fn normalize_strips_line_endings() {
        assert_eq!(normalize_line("test\n".to_string()), "test");
        assert_eq!(normalize_line("test\r\n".to_string()), "test");
        assert_eq!(normalize_line("test".to_string()), "test");
        assert_eq!(normalize_line(String::new()), "");
    }

    #[tokio::test(start_paused = true)]
    async fn poller_waits_for_missing_file_then_reads() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("script.log");
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_file_poller(log.clone(), Arc::clone(&exited), tx);

        // let a couple of open retries elapse with the file absent
        tokio::time::sleep(OPEN_RETRY_INTERVAL * 2).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(&log, "first line\nsecond line\n").unwrap();
        tokio::time::sleep(OPEN_RETRY_INTERVAL).await;

        assert_eq!(rx.recv().await.unwrap(), "first line");
        assert_eq!(rx.recv().await.unwrap(), "second line");

        exited.store(true, Ordering::SeqCst);
        tokio::time::sleep(POLL_INTERVAL).await;
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_drains_once_more_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("script.log");
        std::fs::write(&log, "early\n").unwrap();
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_file_poller(log.clone(), Arc::clone(&exited), tx);
        assert_eq!(rx.recv().await.unwrap(), "early");

        // output that lands in the window between exit and observation
        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "late output").unwrap();
        exited.store(true, Ordering::SeqCst);

        assert_eq!(rx.recv().await.unwrap(), "late output");
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_reassembles_partial_lines_across_polls() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("script.log");
        std::fs::write(&log, "partial").unwrap();
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_file_poller(log.clone(), Arc::clone(&exited), tx);
        tokio::time::sleep(POLL_INTERVAL).await;
        assert!(rx.try_recv().is_err());

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, " line completed\n").unwrap();
        drop(file);

        assert_eq!(rx.recv().await.unwrap(), "partial line completed");
        exited.store(true, Ordering::SeqCst);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn poller_flushes_trailing_partial_line_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("script.log");
        std::fs::write(&log, "done\ntrailing fragment").unwrap();
        let exited = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_file_poller(log, exited, tx);
        handle.await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "done");
        assert_eq!(rx.recv().await.unwrap(), "trailing fragment");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_gives_up_when_script_exits_without_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("never_created.log");
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_file_poller(log, Arc::clone(&exited), tx);
        tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
        exited.store(true, Ordering::SeqCst);
        tokio::time::sleep(OPEN_RETRY_INTERVAL).await;

        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_reader_forwards_until_eof() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("printf 'alpha\\nbeta\\n'");
        cmd.stdout(std::process::Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        let stdout = child.stdout.take().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_pipe_reader(stdout, tx);

        assert_eq!(rx.recv().await.unwrap(), "alpha");
        assert_eq!(rx.recv().await.unwrap(), "beta");
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
        child.wait().await.unwrap();
    }
}
