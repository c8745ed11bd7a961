//! Supervision of launched processes.
//!
//! Each started process gets one watcher task that wires up its stdio
//! redirections, waits for it to exit (or for a kill request), and reports the
//! outcome. The supervisor keeps a table of live processes for `ps`, `kill`
//! and shutdown, plus a counter of processes still running.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::spawner::{SpawnedProcess, spawn};
use super::{LaunchSpec, ProcessError, ProcessInfo, StdioTargets};
use crate::forwarder::{STREAM_STDERR, STREAM_STDOUT};

/// Interval between checks of the running-process counter.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for output relays to flush after a process exits.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for force-killed processes to be reaped.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the outcome of one launch.
pub trait LaunchReporter: Send + Sync + 'static {
    /// The process started with `pid`.
    fn started(&self, pid: u32);

    /// The launch failed, or waiting on a started process failed.
    fn failed(&self, error: &str);

    /// The process exited.
    fn exited(&self, exit_code: i32, timestamp: &str);
}

#[derive(Debug)]
struct ProcessEntry {
    info: ProcessInfo,
    kill: CancellationToken,
}

/// Table of processes started by this daemon.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    processes: Mutex<BTreeMap<u32, ProcessEntry>>,
    running: AtomicUsize,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `spec` and hands it to a watcher task.
    ///
    /// Success and failure are both reported through `reporter` as well as
    /// returned. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the [`ProcessError`] that prevented the process from starting.
    pub fn launch(
        self: &Arc<Self>,
        spec: &LaunchSpec,
        launch_id: u64,
        single_user: bool,
        reporter: Arc<dyn LaunchReporter>,
    ) -> Result<u32, ProcessError> {
        let SpawnedProcess { child, pid } = match spawn(spec, single_user) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(launch_id, error = %e, "launch failed");
                reporter.failed(&e.to_string());
                return Err(e);
            },
        };

        let kill = CancellationToken::new();
        let info = ProcessInfo {
            pid,
            launch_id,
            rank: spec.rank.clone().unwrap_or_else(|| "0".to_string()),
            command: spec.command.clone(),
        };
        self.processes.lock().expect("lock poisoned").insert(
            pid,
            ProcessEntry {
                info,
                kill: kill.clone(),
            },
        );
        self.running.fetch_add(1, Ordering::SeqCst);
        info!(launch_id, pid, command = %spec.command, "process started");
        reporter.started(pid);

        tokio::spawn(Arc::clone(self).supervise(child, pid, spec.stdio.clone(), kill, reporter));
        Ok(pid)
    }

    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        pid: u32,
        stdio: StdioTargets,
        kill: CancellationToken,
        reporter: Arc<dyn LaunchReporter>,
    ) {
        let (input_relay, output_relays) = start_relays(&mut child, &stdio);

        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => {
                debug!(pid, "force killing process group");
                signal_group(pid, Signal::SIGKILL);
                if let Err(e) = child.start_kill() {
                    debug!(pid, error = %e, "kill after group signal");
                }
                child.wait().await
            },
        };

        for relay in output_relays {
            if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, relay).await.is_err() {
                warn!(pid, "output relay did not drain in time");
            }
        }
        if let Some(relay) = input_relay {
            relay.abort();
        }

        let timestamp = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.3f")
            .to_string();
        self.processes.lock().expect("lock poisoned").remove(&pid);
        self.running.fetch_sub(1, Ordering::SeqCst);

        match status {
            Ok(status) => {
                let code = exit_code(status);
                info!(pid, exit_code = code, "process exited");
                reporter.exited(code, &timestamp);
            },
            Err(e) => {
                warn!(pid, error = %e, "failed to wait for process");
                reporter.failed(&format!("wait failed: {e}"));
            },
        }
    }

    /// Force-kills one process. Returns `false` if `pid` is not ours.
    pub fn kill(&self, pid: u32) -> bool {
        let processes = self.processes.lock().expect("lock poisoned");
        processes.get(&pid).is_some_and(|entry| {
            entry.kill.cancel();
            true
        })
    }

    /// Force-kills every process. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let processes = self.processes.lock().expect("lock poisoned");
        for entry in processes.values() {
            entry.kill.cancel();
        }
        processes.len()
    }

    /// Snapshot of live processes, ordered by pid.
    #[must_use]
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    #[must_use]
    pub fn is_running(&self, pid: u32) -> bool {
        self.processes.lock().expect("lock poisoned").contains_key(&pid)
    }

    /// Number of processes that have not been reaped yet.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops every process: `SIGTERM` first, then a force kill for anything
    /// still alive after `grace`. Returns once the running counter is zero,
    /// or `false` if force-killed processes could not be reaped in time.
    pub async fn shutdown_all(&self, grace: Duration) -> bool {
        let pids: Vec<u32> = self
            .processes
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        if pids.is_empty() && self.running() == 0 {
            return true;
        }

        info!(count = pids.len(), "terminating processes");
        for pid in &pids {
            signal_group(*pid, Signal::SIGTERM);
        }
        if self.wait_idle(grace).await {
            return true;
        }

        let killed = self.kill_all();
        warn!(killed, "processes ignored SIGTERM, force killing");
        self.wait_idle(FORCE_KILL_TIMEOUT).await
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.running() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!(pid, ?signal, error = %e, "signal to process group failed");
    }
}

/// Exit code of a finished process. A signal death is reported the way a
/// shell would, as `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |signal| 128 + signal))
}

type Relay = JoinHandle<()>;

fn start_relays(child: &mut Child, stdio: &StdioTargets) -> (Option<Relay>, Vec<Relay>) {
    let input = match (child.stdin.take(), stdio.stdin.clone()) {
        (Some(stdin), Some(target)) => Some(tokio::spawn(async move {
            if let Err(e) = relay_input(stdin, &target).await {
                debug!(%target, error = %e, "stdin relay ended");
            }
        })),
        _ => None,
    };

    let mut outputs = Vec::new();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    if stdio.merged {
        if let (Some(out), Some(err), Some(target)) = (stdout, stderr, stdio.stdout.clone()) {
            outputs.push(tokio::spawn(async move {
                if let Err(e) = relay_merged(out, err, &target).await {
                    warn!(%target, error = %e, "merged output relay failed");
                }
            }));
        }
    } else {
        if let (Some(out), Some(target)) = (stdout, stdio.stdout.clone()) {
            outputs.push(spawn_output_relay(out, target, STREAM_STDOUT));
        }
        if let (Some(err), Some(target)) = (stderr, stdio.stderr.clone()) {
            outputs.push(spawn_output_relay(err, target, STREAM_STDERR));
        }
    }
    (input, outputs)
}

fn spawn_output_relay<R>(source: R, target: String, stream: u8) -> Relay
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = relay_output(source, &target, stream).await {
            warn!(%target, stream, error = %e, "output relay failed");
        }
    })
}

async fn relay_input(mut stdin: ChildStdin, target: &str) -> io::Result<()> {
    let mut source = TcpStream::connect(target).await?;
    tokio::io::copy(&mut source, &mut stdin).await?;
    stdin.shutdown().await
}

async fn relay_output<R>(mut source: R, target: &str, stream: u8) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut sink = TcpStream::connect(target).await?;
    sink.write_all(&[stream]).await?;
    tokio::io::copy(&mut source, &mut sink).await?;
    sink.shutdown().await
}

async fn relay_merged(mut out: ChildStdout, mut err: ChildStderr, target: &str) -> io::Result<()> {
    let mut sink = TcpStream::connect(target).await?;
    sink.write_all(&[STREAM_STDOUT]).await?;

    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);
    while out_open || err_open {
        tokio::select! {
            read = out.read(&mut out_buf), if out_open => match read? {
                0 => out_open = false,
                n => sink.write_all(&out_buf[..n]).await?,
            },
            read = err.read(&mut err_buf), if err_open => match read? {
                0 => err_open = false,
                n => sink.write_all(&err_buf[..n]).await?,
            },
        }
    }
    sink.shutdown().await
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Started(u32),
        Failed(String),
        Exited(i32),
    }

    struct ChannelReporter(mpsc::UnboundedSender<Event>);

    impl LaunchReporter for ChannelReporter {
        fn started(&self, pid: u32) {
            let _ = self.0.send(Event::Started(pid));
        }

        fn failed(&self, error: &str) {
            let _ = self.0.send(Event::Failed(error.to_string()));
        }

        fn exited(&self, exit_code: i32, _timestamp: &str) {
            let _ = self.0.send(Event::Exited(exit_code));
        }
    }

    fn reporter() -> (Arc<dyn LaunchReporter>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelReporter(tx)), rx)
    }

    #[tokio::test]
    async fn reports_start_and_exit() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let (reporter, mut events) = reporter();

        let pid = supervisor
            .launch(&LaunchSpec::new("exit 3"), 1, true, reporter)
            .unwrap();
        assert_eq!(events.recv().await, Some(Event::Started(pid)));
        assert_eq!(events.recv().await, Some(Event::Exited(3)));
        assert_eq!(supervisor.running(), 0);
        assert!(supervisor.list().is_empty());
        assert!(!supervisor.is_running(pid));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let (reporter, mut events) = reporter();

        let result = supervisor.launch(&LaunchSpec::new("true"), 1, false, reporter);
        assert!(result.is_err());
        assert_eq!(
            events.recv().await,
            Some(Event::Failed(
                "launch without credentials not permitted on this node".into()
            ))
        );
    }

    #[tokio::test]
    async fn kill_ends_long_running_process() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let (reporter, mut events) = reporter();

        let pid = supervisor
            .launch(&LaunchSpec::new("sleep 30"), 4, true, reporter)
            .unwrap();
        assert_eq!(events.recv().await, Some(Event::Started(pid)));
        assert_eq!(supervisor.list()[0].launch_id, 4);
        assert!(supervisor.is_running(pid));

        assert!(supervisor.kill(pid));
        assert!(!supervisor.kill(pid + 100_000));
        match events.recv().await {
            Some(Event::Exited(code)) => assert_ne!(code, 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_all_waits_for_every_process() {
        let supervisor = Arc::new(ProcessSupervisor::new());
        for id in 0..3 {
            let (reporter, _events) = reporter();
            supervisor
                .launch(&LaunchSpec::new("sleep 30"), id, true, reporter)
                .unwrap();
        }
        assert_eq!(supervisor.running(), 3);
        assert!(supervisor.shutdown_all(Duration::from_secs(2)).await);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn stdout_is_relayed_with_stream_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let supervisor = Arc::new(ProcessSupervisor::new());
        let (reporter, mut events) = reporter();
        let mut spec = LaunchSpec::new("echo relayed");
        spec.stdio.stdout = Some(addr.to_string());
        supervisor.launch(&spec, 1, true, reporter).unwrap();

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received[0], STREAM_STDOUT);
        assert_eq!(&received[1..], b"relayed\n");

        assert!(matches!(events.recv().await, Some(Event::Started(_))));
        assert_eq!(events.recv().await, Some(Event::Exited(0)));
    }
}
