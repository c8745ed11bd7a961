//! `kill`, `killall`, `ps` and `barrier`.

use std::sync::Arc;

use mpd_core::wire::{Command, keys, reply};
use tracing::{debug, warn};

use crate::protocol::dispatch::{ReplyTo, Route, forward, full_circle, pass_along, route};
use crate::protocol::{Context, ProtocolResult, Role};
use crate::state::SharedState;

/// `kill [host=H] pid=P`. Silent everywhere, including when `H` is not on the
/// ring.
pub fn kill(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(_) => {
            match command
                .arg_or(0, keys::PID)
                .and_then(|pid| pid.trim().parse::<u32>().ok())
            {
                Some(pid) => {
                    if !state.supervisor.kill(pid) {
                        debug!(pid, "kill: no such process");
                    }
                },
                None => warn!("kill without pid"),
            }
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(_) => debug!(host = ?command.get(keys::HOST), "kill target not on the ring"),
    }
    Ok(())
}

/// `killall`: every node kills every process it started.
pub fn killall(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    if pass_along(state, context, command) {
        let killed = state.supervisor.kill_all();
        debug!(killed, "killall");
    }
    Ok(())
}

/// `ps`: process entries accumulated in ring order.
pub fn ps(state: &SharedState, context: &Arc<Context>, mut command: Command) -> ProtocolResult<()> {
    if full_circle(state, context, &command) {
        let result = command.get(keys::RESULT).unwrap_or_default();
        ReplyTo::of(context, &command).send(state, format!("{}={result}", keys::RESULT));
        return Ok(());
    }

    let local = state
        .supervisor
        .list()
        .iter()
        .map(|info| info.ps_entry(state.identity.host()))
        .collect::<Vec<_>>()
        .join("|");
    let merged = match command.get(keys::RESULT) {
        Some(so_far) if context.role() != Role::Console && !so_far.is_empty() => {
            if local.is_empty() {
                so_far.to_string()
            } else {
                format!("{so_far}|{local}")
            }
        },
        _ => local,
    };
    command.set(keys::RESULT, merged);
    forward(state, context, command);
    Ok(())
}

/// `barrier name=N count=C`.
///
/// Every arrival is broadcast, so each node counts the same arrivals and
/// releases its own waiting consoles when the count is reached.
pub fn barrier(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let name = command.get(keys::NAME).filter(|name| !name.is_empty());
    let count = command.get_parsed::<usize>(keys::COUNT);
    let (Some(name), Some(count)) = (name, count) else {
        warn!(conn = %context.id(), "malformed barrier");
        return super::answer_console(context, reply::FAIL);
    };
    if !pass_along(state, context, command) {
        return Ok(());
    }
    let waiter = (context.role() == Role::Console).then(|| context.sink());
    let outcome = state.barriers.arrive(name, count, waiter);
    debug!(name, count, ?outcome, "barrier arrival");
    Ok(())
}
