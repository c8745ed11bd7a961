//! Process spawning utilities.
//!
//! Commands run through `/bin/sh -c` in their own process group so that a
//! kill reaches everything the shell started.

use std::process::Stdio;

use nix::unistd::{Uid, User};
use tokio::process::{Child, Command};
use tracing::debug;

use super::{LaunchSpec, ProcessError};

/// Shell used to interpret launch command lines.
pub const SHELL: &str = "/bin/sh";

/// A spawned process with its child handle and PID.
pub struct SpawnedProcess {
    /// The child process handle.
    pub child: Child,
    /// The OS process ID.
    pub pid: u32,
}

/// Spawn a process according to its launch specification.
///
/// Streams with a redirection target are piped; the rest are connected to
/// `/dev/null`. With `single_user` unset a launch without an account is
/// refused.
///
/// # Errors
///
/// Returns `ProcessError::CredentialsRequired`, `UnknownAccount`,
/// `AccountRefused` or `Logon` when the requested identity cannot be used, and
/// `ProcessError::SpawnFailed` if the process cannot be spawned or its PID
/// cannot be obtained.
pub fn spawn(spec: &LaunchSpec, single_user: bool) -> Result<SpawnedProcess, ProcessError> {
    let mut cmd = match spec.priority {
        Some(nice) if nice != 0 => {
            let mut cmd = Command::new("nice");
            cmd.arg("-n").arg(nice.to_string()).arg(SHELL);
            cmd
        },
        _ => Command::new(SHELL),
    };
    cmd.arg("-c").arg(&spec.command);

    cmd.stdin(piped_if(spec.stdio.stdin.is_some()))
        .stdout(piped_if(spec.stdio.stdout.is_some()))
        .stderr(piped_if(spec.stdio.stderr.is_some()))
        .process_group(0)
        .kill_on_drop(false);

    if let Some(dir) = &spec.dir {
        cmd.current_dir(dir);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    match &spec.account {
        Some(account) => check_account(account)?,
        None if !single_user => return Err(ProcessError::CredentialsRequired),
        None => {},
    }

    let child = cmd
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| ProcessError::SpawnFailed("failed to get process ID".to_string()))?;

    debug!(pid, command = %spec.command, "spawned process");
    Ok(SpawnedProcess { child, pid })
}

fn piped_if(redirected: bool) -> Stdio {
    if redirected {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Accepts `account` only if it is the account the daemon runs as.
///
/// Passwords are not checked, so a launch never switches to another user.
fn check_account(account: &str) -> Result<(), ProcessError> {
    let user = User::from_name(account)
        .map_err(|e| ProcessError::Logon {
            account: account.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ProcessError::UnknownAccount {
            account: account.to_string(),
        })?;

    if user.uid != Uid::effective() {
        return Err(ProcessError::AccountRefused {
            account: account.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = LaunchSpec::new("echo hello");

        let mut spawned = spawn(&spec, true).unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_with_env_and_dir() {
        let mut spec = LaunchSpec::new("test \"$TEST_VAR\" = test_value && test \"$(pwd)\" = /");
        spec.env.push(("TEST_VAR".into(), "test_value".into()));
        spec.dir = Some("/".into());

        let mut spawned = spawn(&spec, true).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_exit_code_passes_through_shell() {
        let mut spawned = spawn(&LaunchSpec::new("exit 7"), true).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn test_credentials_required_when_not_single_user() {
        let result = spawn(&LaunchSpec::new("true"), false);
        assert!(matches!(result, Err(ProcessError::CredentialsRequired)));
    }

    #[test]
    fn test_unknown_account() {
        let mut spec = LaunchSpec::new("true");
        spec.account = Some("no_such_user_mpd_12345".into());
        assert!(matches!(
            spawn(&spec, true),
            Err(ProcessError::UnknownAccount { .. })
        ));
    }

    #[test]
    fn test_other_account_refused() {
        let other = if Uid::effective().is_root() { "nobody" } else { "root" };
        let mut spec = LaunchSpec::new("id -u");
        spec.account = Some(other.into());
        assert!(matches!(
            spawn(&spec, true),
            Err(ProcessError::AccountRefused { .. })
        ));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_own_account_allowed() {
        let me = User::from_uid(Uid::effective()).unwrap().unwrap();
        let mut spec = LaunchSpec::new("true");
        spec.account = Some(me.name);
        let mut spawned = spawn(&spec, false).unwrap();
        assert!(spawned.child.wait().await.unwrap().success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_missing_directory_fails() {
        let mut spec = LaunchSpec::new("true");
        spec.dir = Some("/nonexistent_dir_mpd_12345".into());
        assert!(matches!(spawn(&spec, true), Err(ProcessError::SpawnFailed(_))));
    }
}
