//! `launch` and the per-id queries.
//!
//! The console gets the launch id back before anything else happens. The
//! process itself may start on another node; its pid and exit code come home
//! as `launched` and `exitcode` messages addressed to the issuing host.

use std::sync::{Arc, Weak};

use mpd_core::launch::LaunchId;
use mpd_core::process::{LaunchReporter, LaunchSpec};
use mpd_core::wire::{Command, keys, reply};
use tracing::{debug, warn};

use crate::protocol::dispatch::{Arrival, arrive};
use crate::protocol::{Context, ProtocolResult, Role};
use crate::ring::explicit_port;
use crate::state::{DaemonState, SharedState};

/// Handles `launch` from a console or from the ring.
pub async fn launch(state: &SharedState, context: &Arc<Context>, mut command: Command) -> ProtocolResult<()> {
    if context.role() == Role::Console {
        let id = state.tracker.create(command.get_parsed(keys::ID));
        context.reply(id.to_string())?;
        let remote = command
            .get(keys::LAUNCH_HOST)
            .is_some_and(|host| !state.identity.matches(host));
        if remote {
            command.set(keys::ID, id.to_string());
            command.set(keys::SRC, state.identity.host());
            command.set(keys::TRY, "1");
            command.remove(keys::SOCK);
            state.ring.forward(command.to_line());
        } else {
            start(state, &command, id, local_reporter(state, id));
        }
        return Ok(());
    }

    let origin = command.get(keys::SRC).map(str::to_string);
    let id = command.get_parsed::<LaunchId>(keys::ID);
    let (Some(origin), Some(id)) = (origin, id) else {
        warn!("ring launch without src or id");
        return Ok(());
    };
    let from_here = state.identity.matches(&origin);

    match command.get(keys::LAUNCH_HOST).map(str::to_string) {
        Some(host) if !state.identity.matches(&host) => {
            if !from_here {
                state.ring.forward(command.to_line());
                return Ok(());
            }
            let attempt: u32 = command.get_parsed(keys::TRY).unwrap_or(1);
            if attempt < 2 {
                if let Some(resolved) = resolve(state, &host).await.filter(|r| *r != host) {
                    debug!(id, %host, %resolved, "retrying launch by address");
                    command.set(keys::LAUNCH_HOST, resolved);
                    command.set(keys::TRY, "2");
                    state.ring.forward(command.to_line());
                    return Ok(());
                }
            }
            warn!(id, %host, "launch host is not on the ring");
            state.tracker.save_error(id, reply::INVALID_HOST);
        },
        _ => {
            let reporter: Arc<dyn LaunchReporter> = if from_here {
                local_reporter(state, id)
            } else {
                Arc::new(RingReporter {
                    state: Arc::downgrade(state),
                    origin,
                    id,
                })
            };
            start(state, &command, id, reporter);
        },
    }
    Ok(())
}

/// Resolves `host` to an address string in the form nodes are named by.
async fn resolve(state: &SharedState, host: &str) -> Option<String> {
    let addr = tokio::net::lookup_host(state.identity.dial_addr(host))
        .await
        .ok()?
        .next()?;
    Some(if explicit_port(host).is_some() {
        addr.to_string()
    } else {
        addr.ip().to_string()
    })
}

fn start(state: &SharedState, command: &Command, id: LaunchId, reporter: Arc<dyn LaunchReporter>) {
    let mut spec = match LaunchSpec::from_command(command) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(id, error = %e, "rejecting launch");
            reporter.failed(&e.to_string());
            return;
        },
    };
    apply_mpd_user(state, &mut spec);
    if let Err(e) = state
        .supervisor
        .launch(&spec, id, state.config.single_user(), reporter)
    {
        debug!(id, error = %e, "launch failure reported");
    }
}

/// Runs credential-less launches as the configured mpd user when enabled.
fn apply_mpd_user(state: &SharedState, spec: &mut LaunchSpec) {
    if spec.account.is_some() {
        return;
    }
    let config = state.config.snapshot();
    if !config.use_mpd_user {
        return;
    }
    if let Some(account) = config.mpd_user {
        spec.account = Some(account);
    }
}

fn local_reporter(state: &SharedState, id: LaunchId) -> Arc<dyn LaunchReporter> {
    Arc::new(LocalReporter {
        state: Arc::downgrade(state),
        id,
    })
}

/// Records the outcome of a launch issued on this node.
struct LocalReporter {
    state: Weak<DaemonState>,
    id: LaunchId,
}

impl LaunchReporter for LocalReporter {
    fn started(&self, pid: u32) {
        if let Some(state) = self.state.upgrade() {
            state.tracker.save_pid(self.id, pid);
        }
    }

    fn failed(&self, error: &str) {
        if let Some(state) = self.state.upgrade() {
            state.tracker.save_error(self.id, error);
        }
    }

    fn exited(&self, exit_code: i32, timestamp: &str) {
        if let Some(state) = self.state.upgrade() {
            state.tracker.save_timestamp(self.id, timestamp);
            state.tracker.save_exit_code(self.id, exit_code);
        }
    }
}

/// Sends the outcome of a launch back to the node that issued it.
struct RingReporter {
    state: Weak<DaemonState>,
    origin: String,
    id: LaunchId,
}

impl RingReporter {
    fn send(&self, verb: &str, fields: &[(&str, String)]) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut command = Command::new(verb)
            .with(keys::SRC, state.identity.host())
            .with(keys::DEST, self.origin.as_str())
            .with(keys::ID, self.id.to_string());
        for (key, value) in fields {
            command.set(*key, value.as_str());
        }
        state.ring.forward(command.to_line());
    }
}

impl LaunchReporter for RingReporter {
    fn started(&self, pid: u32) {
        self.send("launched", &[(keys::PID, pid.to_string())]);
    }

    fn failed(&self, error: &str) {
        self.send("launched", &[(keys::ERROR, error.to_string())]);
    }

    fn exited(&self, exit_code: i32, timestamp: &str) {
        self.send(
            "exitcode",
            &[
                (keys::CODE, exit_code.to_string()),
                (keys::TIME, timestamp.to_string()),
            ],
        );
    }
}

/// `launched`: the pid or error of a launch issued here.
pub fn launched(state: &SharedState, command: &Command) {
    if arrive(state, command) != Arrival::Here {
        return;
    }
    let Some(id) = command.get_parsed::<LaunchId>(keys::ID) else {
        warn!("launched without id");
        return;
    };
    match command.get_parsed::<u32>(keys::PID) {
        Some(pid) => {
            state.tracker.save_pid(id, pid);
        },
        None => {
            let error = command.get(keys::ERROR).unwrap_or("launch failed");
            state.tracker.save_error(id, error);
        },
    }
}

/// `exitcode`: a process launched for this node has exited.
pub fn exited(state: &SharedState, command: &Command) {
    if arrive(state, command) != Arrival::Here {
        return;
    }
    let Some(id) = command.get_parsed::<LaunchId>(keys::ID) else {
        warn!("exitcode without id");
        return;
    };
    if let Some(time) = command.get(keys::TIME) {
        state.tracker.save_timestamp(id, time);
    }
    let code = command.get_parsed::<i32>(keys::CODE).unwrap_or(-1);
    state.tracker.save_exit_code(id, code);
}

fn launch_id(command: &Command) -> Option<LaunchId> {
    command
        .arg_or(0, keys::ID)
        .and_then(|id| id.trim().parse().ok())
}

pub fn getpid(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(id) = launch_id(command) else {
        return context.reply(reply::UNKNOWN_PID);
    };
    match state.tracker.query_pid(id, &context.sink()) {
        Some(pid) => context.reply(pid),
        None => Ok(()),
    }
}

pub fn getexitcode(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    match launch_id(command) {
        Some(id) => context.reply(state.tracker.query_exit_code(id)),
        None => context.reply(reply::FAIL),
    }
}

/// Answers once the process exits. A second waiter on the same id gets
/// `FAIL`.
pub fn getexitcodewait(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(id) = launch_id(command) else {
        return context.reply(reply::FAIL);
    };
    match state.tracker.query_exit_code_wait(id, &context.sink()) {
        Some(code) => context.reply(code),
        None => Ok(()),
    }
}

pub fn getexittime(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    match launch_id(command) {
        Some(id) => context.reply(state.tracker.query_exit_time(id)),
        None => context.reply(reply::FAIL),
    }
}

pub fn geterror(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    match launch_id(command) {
        Some(id) => context.reply(state.tracker.query_error(id)),
        None => context.reply(reply::FAIL),
    }
}

pub fn freeprocess(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let freed = launch_id(command).is_some_and(|id| state.tracker.free(id));
    context.reply(super::status(freed))
}
