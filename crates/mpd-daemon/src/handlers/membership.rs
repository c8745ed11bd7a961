//! Ring-wide listing and membership verbs.

use std::sync::Arc;

use mpd_core::wire::{Command, keys, reply};
use tracing::{info, warn};

use crate::protocol::dispatch::{ReplyTo, forward, full_circle, pass_along};
use crate::protocol::{Context, ProtocolResult, Role};
use crate::ring::{self, RingSummary};
use crate::state::SharedState;

/// Largest `next N` accepted.
pub const MAX_NEXT: usize = 4096;

/// `hosts`: `result=` grows by one host per node, starting here.
pub fn hosts(state: &SharedState, context: &Arc<Context>, mut command: Command) -> ProtocolResult<()> {
    let host = state.identity.host();
    if context.role() == Role::Console {
        forward(state, context, Command::new("hosts").with(keys::RESULT, host));
        return Ok(());
    }
    let so_far = command.get(keys::RESULT).unwrap_or_default().to_string();
    if full_circle(state, context, &command) {
        ReplyTo::of(context, &command).send(state, format!("{}={so_far}", keys::RESULT));
        return Ok(());
    }
    let list = if so_far.is_empty() {
        host.to_string()
    } else {
        format!("{so_far},{host}")
    };
    command.set(keys::RESULT, list);
    state.ring.forward(command.to_line());
    Ok(())
}

/// `next N`: N host names in ring order from here, wrapping as often as
/// needed. Each name is its own reply line.
pub fn next(state: &SharedState, context: &Arc<Context>, mut command: Command) -> ProtocolResult<()> {
    let host = state.identity.host().to_string();
    if context.role() == Role::Console {
        let count = command
            .arg_or(0, keys::COUNT)
            .and_then(|n| n.trim().parse::<usize>().ok())
            .filter(|n| (1..=MAX_NEXT).contains(n));
        let Some(count) = count else {
            return context.reply(reply::INVALID_HOST_COUNT);
        };
        if count == 1 {
            return context.reply(host);
        }
        let request = Command::new("next")
            .with(keys::COUNT, count.to_string())
            .with(keys::RESULT, host);
        forward(state, context, request);
        return Ok(());
    }

    let Some(count) = command.get_parsed::<usize>(keys::COUNT) else {
        warn!("next without count");
        return Ok(());
    };
    let mut hosts: Vec<String> = command
        .get(keys::RESULT)
        .unwrap_or_default()
        .split(',')
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    if hosts.len() < count {
        hosts.push(host);
    }
    if full_circle(state, context, &command) && hosts.len() >= count {
        let reply_to = ReplyTo::of(context, &command);
        for name in hosts.into_iter().take(count) {
            reply_to.send(state, name);
        }
        return Ok(());
    }
    command.set(keys::RESULT, hosts.join(","));
    state.ring.forward(command.to_line());
    Ok(())
}

/// `insert host=H`.
pub async fn insert(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(host) = command.arg_or(0, keys::HOST).filter(|h| !h.is_empty()) else {
        return context.reply(format!("{} missing host", reply::FAIL));
    };
    match ring::insert(state, host).await {
        Ok(()) => context.reply(reply::SUCCESS),
        Err(e) => {
            warn!(host, error = %e, "insert failed");
            context.reply(format!("{} {e}", reply::FAIL))
        },
    }
}

/// `extract`: leave the ring and keep running solo.
pub async fn extract(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    ring::extract(state, true).await;
    context.reply(reply::SUCCESS)
}

/// `shutdown`: leave the ring and exit.
pub async fn shutdown(state: &SharedState) -> ProtocolResult<()> {
    info!("shutdown requested by console");
    ring::extract(state, false).await;
    Ok(())
}

/// `restart`: leave the ring and stop, then start again with the same
/// arguments.
pub async fn restart(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    info!("restart requested by console");
    context.reply(reply::SUCCESS)?;
    state.request_restart();
    ring::extract(state, false).await;
    Ok(())
}

/// `exitall`: every node passes it on, then exits.
pub fn exitall(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    if pass_along(state, context, command) {
        info!("exitall received");
    }
    state.request_shutdown();
    Ok(())
}

pub fn print(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    context.reply(RingSummary::new(state).to_string())
}

/// `connect left H` from the left link.
pub async fn connect_left(state: &SharedState, command: &Command) {
    let Some(host) = command.arg(1).filter(|h| !h.is_empty()) else {
        warn!("connect left without host");
        return;
    };
    if let Err(e) = ring::connect_left(state, host).await {
        warn!(host, error = %e, "connect left failed");
    }
}
