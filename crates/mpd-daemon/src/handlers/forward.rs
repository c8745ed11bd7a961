//! I/O forwarders and scratch files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mpd_core::forwarder::StopMode;
use mpd_core::wire::{Command, keys, reply};
use tracing::{debug, warn};

use super::status;
use crate::protocol::dispatch::{Route, forward, pass_along, route};
use crate::protocol::{Context, ProtocolResult};
use crate::state::SharedState;

/// Name prefix of files made by `createtmpfile`.
pub const TMP_PREFIX: &str = "mpd.";

/// How often `mpich1readint` looks at its file.
const READ_INT_POLL: Duration = Duration::from_millis(100);

/// Longest `mpich1readint` waits for a value.
pub const READ_INT_TIMEOUT: Duration = Duration::from_secs(30);

/// `createforwarder [host=H] forward=X:P`: replies with the local port.
pub async fn create(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let answer = match command.get(keys::FORWARD) {
                Some(dest) => match state.forwarders.create(dest).await {
                    Ok(port) => port.to_string(),
                    Err(e) => {
                        warn!(dest, error = %e, "cannot create forwarder");
                        reply::FAIL.to_string()
                    },
                },
                None => reply::FAIL.to_string(),
            };
            reply_to.send(state, answer);
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::FAIL),
    }
    Ok(())
}

/// `stopforwarder [host=H] port=P [abort=yes]`.
pub fn stop(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let mode = if command
                .get(keys::ABORT)
                .is_some_and(|a| a.eq_ignore_ascii_case("yes"))
            {
                StopMode::Abort
            } else {
                StopMode::Drain
            };
            let stopped = command
                .get_parsed::<u16>(keys::PORT)
                .is_some_and(|port| state.forwarders.stop(port, mode));
            reply_to.send(state, status(stopped));
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::FAIL),
    }
    Ok(())
}

/// `killforwarders`: every node aborts every forwarder.
pub fn kill_all(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    if pass_along(state, context, command) {
        let aborted = state.forwarders.abort_all();
        debug!(aborted, "killforwarders");
    }
    Ok(())
}

/// `createtmpfile [host=H]`: replies with the path of a new empty file.
pub fn create_tmp_file(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let answer = match make_tmp_file(&state.config.temp_dir()) {
                Ok(path) => path.display().to_string(),
                Err(e) => {
                    warn!(error = %e, "cannot create temp file");
                    reply::FAIL.to_string()
                },
            };
            reply_to.send(state, answer);
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::FAIL),
    }
    Ok(())
}

fn make_tmp_file(dir: &Path) -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new().prefix(TMP_PREFIX).tempfile_in(dir)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// `deletetmpfile [host=H] file=F`. Only files this daemon could have made
/// are removed.
pub async fn delete_tmp_file(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let deleted = match command.get(keys::FILE) {
                Some(file) if is_tmp_file(&state.config.temp_dir(), Path::new(file)) => {
                    match tokio::fs::remove_file(file).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(file, error = %e, "cannot delete temp file");
                            false
                        },
                    }
                },
                _ => false,
            };
            reply_to.send(state, status(deleted));
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::FAIL),
    }
    Ok(())
}

/// `mpich1readint [host=H] file=F [pid=P]`: replies with the first integer
/// written to a scratch file.
///
/// The file must be one `createtmpfile` could have made. The reply is `FAIL`
/// if process `P` exits without writing one, or after [`READ_INT_TIMEOUT`].
pub fn read_int(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let file = command
                .get(keys::FILE)
                .map(PathBuf::from)
                .filter(|file| is_tmp_file(&state.config.temp_dir(), file));
            let Some(file) = file else {
                reply_to.send(state, reply::FAIL);
                return Ok(());
            };
            let pid = command.get_parsed::<u32>(keys::PID);
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let answer = match wait_for_int(&state, &file, pid).await {
                    Some(value) => value.to_string(),
                    None => reply::FAIL.to_string(),
                };
                reply_to.send(&state, answer);
            });
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::FAIL),
    }
    Ok(())
}

async fn wait_for_int(state: &SharedState, file: &Path, pid: Option<u32>) -> Option<i64> {
    let deadline = tokio::time::Instant::now() + READ_INT_TIMEOUT;
    loop {
        if let Some(value) = read_int_file(file).await {
            return Some(value);
        }
        if pid.is_some_and(|pid| !state.supervisor.is_running(pid)) {
            debug!(file = %file.display(), ?pid, "process exited before writing its value");
            return read_int_file(file).await;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(file = %file.display(), "no integer appeared in time");
            return None;
        }
        tokio::time::sleep(READ_INT_POLL).await;
    }
}

async fn read_int_file(file: &Path) -> Option<i64> {
    let text = tokio::fs::read_to_string(file).await.ok()?;
    text.split_whitespace().next()?.parse().ok()
}

fn is_tmp_file(dir: &Path, file: &Path) -> bool {
    file.parent() == Some(dir)
        && file
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TMP_PREFIX))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_make_and_recognize_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = make_tmp_file(dir.path()).unwrap();
        assert!(path.exists());
        assert!(is_tmp_file(dir.path(), &path));
    }

    #[tokio::test]
    async fn test_read_int_file() {
        let dir = TempDir::new().unwrap();
        let path = make_tmp_file(dir.path()).unwrap();
        assert_eq!(read_int_file(&path).await, None);

        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(read_int_file(&path).await, None);

        std::fs::write(&path, "  5150\n").unwrap();
        assert_eq!(read_int_file(&path).await, Some(5150));

        assert_eq!(read_int_file(&dir.path().join("missing")).await, None);
    }

    #[test]
    fn test_foreign_files_are_not_tmp_files() {
        let dir = Path::new("/tmp/mpd-test");
        assert!(!is_tmp_file(dir, Path::new("/etc/passwd")));
        assert!(!is_tmp_file(dir, Path::new("/tmp/mpd-test/other")));
        assert!(!is_tmp_file(dir, Path::new("/tmp/mpd-test/sub/mpd.x")));
        assert!(is_tmp_file(dir, Path::new("/tmp/mpd-test/mpd.abc")));
    }
}
