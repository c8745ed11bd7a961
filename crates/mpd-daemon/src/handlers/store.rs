//! Persistent key/value settings: `set`, `get`, `delete` and their local
//! `l`-prefixed forms.

use std::sync::Arc;

use mpd_core::wire::{Command, keys, reply};
use tracing::warn;

use super::{answer_console, status};
use crate::protocol::dispatch::{Route, forward, pass_along, route};
use crate::protocol::{Context, ProtocolResult};
use crate::state::SharedState;

fn key_value(command: &Command) -> Option<(&str, &str)> {
    let key = command.get(keys::KEY).filter(|k| !k.is_empty())?;
    Some((key, command.get(keys::VALUE).unwrap_or_default()))
}

fn store(state: &SharedState, key: &str, value: &str) -> bool {
    match state.config.set(key, value) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "set failed");
            false
        },
    }
}

fn remove(state: &SharedState, key: &str) -> bool {
    match state.config.delete(key) {
        Ok(removed) => removed,
        Err(e) => {
            warn!(key, error = %e, "delete failed");
            false
        },
    }
}

/// `set key=K value=V` on every node.
pub fn set(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some((key, value)) = key_value(command) else {
        return answer_console(context, reply::FAIL);
    };
    if !pass_along(state, context, command) {
        return Ok(());
    }
    let stored = store(state, key, value);
    answer_console(context, status(stored))
}

/// `lset key=K value=V` on this node only.
pub fn lset(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let stored = key_value(command).is_some_and(|(key, value)| store(state, key, value));
    context.reply(status(stored))
}

/// `get [host=H] key=K`. A missing key reads as an empty line.
pub fn get(state: &SharedState, context: &Arc<Context>, command: &Command) -> ProtocolResult<()> {
    match route(state, context, command, keys::HOST) {
        Route::Local(reply_to) => {
            let value = command
                .get(keys::KEY)
                .and_then(|key| state.config.get(key))
                .unwrap_or_default();
            reply_to.send(state, value);
        },
        Route::Forward => forward(state, context, command.clone()),
        Route::NotFound(reply_to) => reply_to.send(state, reply::BAD_HOSTNAME),
    }
    Ok(())
}

pub fn lget(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let value = command
        .get(keys::KEY)
        .and_then(|key| state.config.get(key))
        .unwrap_or_default();
    context.reply(value)
}

/// `delete key=K` on every node. The console hears whether this node had it.
pub fn delete(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(key) = command.get(keys::KEY).filter(|k| !k.is_empty()) else {
        return answer_console(context, reply::FAIL);
    };
    if !pass_along(state, context, command) {
        return Ok(());
    }
    let removed = remove(state, key);
    answer_console(context, status(removed))
}

pub fn ldelete(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let removed = command
        .get(keys::KEY)
        .is_some_and(|key| remove(state, key));
    context.reply(status(removed))
}
