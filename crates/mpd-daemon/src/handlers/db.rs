//! The replicated key/value store.
//!
//! Collections are created and destroyed on every node. Entries live on the
//! node that stored them, so lookups that miss locally travel the ring until
//! a node answers with a `dbresult` or the request comes home.

use std::sync::Arc;

use mpd_core::db::{Database, format_entry};
use mpd_core::wire::{Command, keys, reply};
use tracing::debug;

use super::{answer_console, status};
use crate::protocol::dispatch::{ReplyTo, forward, full_circle, pass_along};
use crate::protocol::{Context, ProtocolResult, Role};
use crate::state::SharedState;

const DBRESULT: &str = "dbresult";

/// `dbcreate [name=N]`. The console gets the name back at once; every other
/// node creates the same name.
pub fn create(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    if context.role() != Role::Console {
        if pass_along(state, context, command) {
            if let Some(name) = command.get(keys::NAME) {
                if !state.db.create_named(name) {
                    debug!(name, "collection already present");
                }
            }
        }
        return Ok(());
    }

    let name = match command.get(keys::NAME).filter(|n| !n.is_empty()) {
        Some(name) if state.db.create_named(name) => name.to_string(),
        Some(_) => return context.reply(reply::FAIL),
        None => state.db.create(),
    };
    forward(state, context, Command::new("dbcreate").with(keys::NAME, name.as_str()));
    context.reply(name)
}

/// `dbdestroy name=N` on every node.
pub fn destroy(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(name) = command.get(keys::NAME) else {
        return answer_console(context, reply::FAIL);
    };
    if !pass_along(state, context, command) {
        return Ok(());
    }
    let destroyed = state.db.destroy(name);
    answer_console(context, status(destroyed))
}

/// Tries `op` here. On a miss the request moves right; once it has been
/// everywhere the requester gets `exhausted`.
fn search(
    state: &SharedState,
    context: &Arc<Context>,
    command: Command,
    exhausted: &str,
    op: impl FnOnce(&Database, &Command) -> Option<String>,
) -> ProtocolResult<()> {
    let reply_to = ReplyTo::of(context, &command);
    if full_circle(state, context, &command) {
        reply_to.send_as(state, DBRESULT, exhausted);
        return Ok(());
    }
    match op(&state.db, &command) {
        Some(answer) => reply_to.send_as(state, DBRESULT, answer),
        None => forward(state, context, command),
    }
    Ok(())
}

fn name_and_key(command: &Command) -> Option<(&str, &str)> {
    Some((command.get(keys::NAME)?, command.get(keys::KEY)?))
}

/// `dbput name=N key=K value=V`.
pub fn put(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    if name_and_key(&command).is_none() {
        return answer_console(context, reply::FAIL);
    }
    search(state, context, command, reply::FAIL, |db, command| {
        let (name, key) = name_and_key(command)?;
        let value = command.get(keys::VALUE).unwrap_or_default();
        db.put(name, key, value)
            .ok()
            .map(|()| reply::SUCCESS.to_string())
    })
}

/// `dbget name=N key=K`.
pub fn get(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    if name_and_key(&command).is_none() {
        return answer_console(context, reply::FAIL);
    }
    search(state, context, command, reply::FAIL, |db, command| {
        let (name, key) = name_and_key(command)?;
        db.get(name, key).ok()
    })
}

/// `dbdelete name=N key=K`.
pub fn delete(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    if name_and_key(&command).is_none() {
        return answer_console(context, reply::FAIL);
    }
    search(state, context, command, reply::FAIL, |db, command| {
        let (name, key) = name_and_key(command)?;
        db.delete(name, key)
            .ok()
            .map(|()| reply::SUCCESS.to_string())
    })
}

/// `dbfirst name=N`. Rewinds the cursor on every node, then iterates this
/// node's entries before moving right.
pub fn first(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    let Some(name) = command.get(keys::NAME).map(str::to_string) else {
        return answer_console(context, reply::FAIL);
    };
    if context.role() == Role::Console {
        forward(state, context, Command::new("dbreset").with(keys::NAME, name.as_str()));
    }
    iterate(state, context, command, &name, Database::first)
}

/// `dbnext name=N`.
pub fn next(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    let Some(name) = command.get(keys::NAME).map(str::to_string) else {
        return answer_console(context, reply::FAIL);
    };
    iterate(state, context, command, &name, Database::next)
}

type Step = fn(&Database, &str) -> Result<Option<(String, String)>, mpd_core::db::DbError>;

fn iterate(
    state: &SharedState,
    context: &Arc<Context>,
    command: Command,
    name: &str,
    step: Step,
) -> ProtocolResult<()> {
    if context.role() == Role::Console {
        return match step(&state.db, name) {
            Ok(Some((key, value))) => context.reply(format_entry(&key, &value)),
            Ok(None) => {
                forward(state, context, command);
                Ok(())
            },
            Err(e) => {
                debug!(error = %e, "db iteration");
                context.reply(reply::FAIL)
            },
        };
    }
    search(state, context, command, reply::DBS_END, |db, _| {
        step(db, name)
            .ok()
            .flatten()
            .map(|(key, value)| format_entry(&key, &value))
    })
}

/// `dbreset name=N`, sent ahead of a ring-wide `dbfirst`.
pub fn reset(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    if pass_along(state, context, command) {
        if let Some(name) = command.get(keys::NAME) {
            state.db.reset(name);
        }
    }
    Ok(())
}

pub fn first_db(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    context.reply(state.db.first_db().unwrap_or_else(|| reply::DBS_END.to_string()))
}

pub fn next_db(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    context.reply(state.db.next_db().unwrap_or_else(|| reply::DBS_END.to_string()))
}
