//! Per-line command routing.
//!
//! A line is parsed once and handed to the verb table for the role of the
//! connection it arrived on. Console lines are requests. Lines on a left link
//! are requests forwarded by a neighbor or routed results on their way home.
//! A right link only ever carries `done bounce` and the answer to `new left`.
//!
//! Requests that leave this node are stamped with `src=<local host>` and
//! `sock=<console id>` so the node that finally answers can route the reply
//! back. A request whose `src` is this node has been all the way round the
//! ring.

use std::sync::Arc;

use mpd_core::wire::{Command, keys, reply};
use tracing::{debug, warn};

use super::connection::{Context, Role};
use super::error::ProtocolResult;
use crate::handlers::{admin, db, forward, launch, membership, process, store};
use crate::state::SharedState;

/// Dispatches one line received on `context`.
///
/// # Errors
///
/// Returns a recoverable error for an unparsable line, and
/// [`super::ProtocolError::ConnectionClosed`] when a reply cannot be queued.
pub async fn dispatch(state: &SharedState, context: &Arc<Context>, line: &str) -> ProtocolResult<()> {
    let command = Command::parse(line)?;
    debug!(conn = %context.id(), role = %context.role(), verb = command.verb(), "dispatch");
    match context.role() {
        Role::Console => console(state, context, command).await,
        Role::Left => from_left(state, context, command).await,
        Role::Right => {
            from_right(state, context, &command);
            Ok(())
        },
    }
}

async fn console(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match command.verb() {
        "launch" => launch::launch(state, context, command).await,
        "getpid" => launch::getpid(state, context, &command),
        "getexitcode" => launch::getexitcode(state, context, &command),
        "getexitcodewait" => launch::getexitcodewait(state, context, &command),
        "getexittime" => launch::getexittime(state, context, &command),
        "geterror" => launch::geterror(state, context, &command),
        "freeprocess" => launch::freeprocess(state, context, &command),

        "kill" => process::kill(state, context, command),
        "killall" => process::killall(state, context, &command),
        "ps" => process::ps(state, context, command),
        "barrier" => process::barrier(state, context, &command),

        "hosts" => membership::hosts(state, context, command),
        "next" => membership::next(state, context, command),
        "insert" => membership::insert(state, context, &command).await,
        "extract" => membership::extract(state, context).await,
        "shutdown" => membership::shutdown(state).await,
        "restart" => membership::restart(state, context).await,
        "exitall" => membership::exitall(state, context, &command),
        "print" => membership::print(state, context),
        "done" => {
            context.close();
            Ok(())
        },

        "set" => store::set(state, context, &command),
        "lset" => store::lset(state, context, &command),
        "get" => store::get(state, context, &command),
        "lget" => store::lget(state, context, &command),
        "delete" => store::delete(state, context, &command),
        "ldelete" => store::ldelete(state, context, &command),
        "config" => context.reply(state.config.dump()),

        "dbcreate" => db::create(state, context, &command),
        "dbdestroy" => db::destroy(state, context, &command),
        "dbput" => db::put(state, context, command),
        "dbget" => db::get(state, context, command),
        "dbdelete" => db::delete(state, context, command),
        "dbfirst" => db::first(state, context, command),
        "dbnext" => db::next(state, context, command),
        "dbfirstdb" => db::first_db(state, context),
        "dbnextdb" => db::next_db(state, context),

        "createforwarder" => forward::create(state, context, command).await,
        "stopforwarder" => forward::stop(state, context, command),
        "forwarders" => context.reply(state.forwarders.describe()),
        "killforwarders" => forward::kill_all(state, context, &command),
        "createtmpfile" => forward::create_tmp_file(state, context, command),
        "deletetmpfile" => forward::delete_tmp_file(state, context, command).await,
        "mpich1readint" => forward::read_int(state, context, command),

        "stat" => context.reply(state.stat()),
        "validate" => admin::validate(state, context, command),
        "version" => context.reply(mpd_core::MPD_VERSION),
        "mpich" if command.arg(0).is_some_and(|a| a.eq_ignore_ascii_case("version")) => {
            context.reply(mpd_core::MPICH_VERSION)
        },
        "setmpduser" => admin::set_mpd_user(state, context, &command),
        "clrmpduser" => admin::clear_mpd_user(state, context),
        "enablempduser" => admin::enable_mpd_user(state, context, true),
        "disablempduser" => admin::enable_mpd_user(state, context, false),

        verb => {
            warn!(conn = %context.id(), verb, "unknown console command");
            context.reply(reply::UNKNOWN_COMMAND)
        },
    }
}

async fn from_left(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match command.verb() {
        "launch" => launch::launch(state, context, command).await,
        "launched" => {
            launch::launched(state, &command);
            Ok(())
        },
        "exitcode" => {
            launch::exited(state, &command);
            Ok(())
        },
        "result" | "dbresult" => {
            relay_result(state, &command);
            Ok(())
        },

        "kill" => process::kill(state, context, command),
        "killall" => process::killall(state, context, &command),
        "ps" => process::ps(state, context, command),
        "barrier" => process::barrier(state, context, &command),

        "hosts" => membership::hosts(state, context, command),
        "next" => membership::next(state, context, command),
        "exitall" => membership::exitall(state, context, &command),
        "new" if command.arg(0).is_some_and(|a| a.eq_ignore_ascii_case("left")) => {
            crate::ring::accept_new_left(state, context)
        },
        "connect" if command.arg(0).is_some_and(|a| a.eq_ignore_ascii_case("left")) => {
            membership::connect_left(state, &command).await;
            Ok(())
        },

        "set" => store::set(state, context, &command),
        "get" => store::get(state, context, &command),
        "delete" => store::delete(state, context, &command),

        "dbcreate" => db::create(state, context, &command),
        "dbdestroy" => db::destroy(state, context, &command),
        "dbput" => db::put(state, context, command),
        "dbget" => db::get(state, context, command),
        "dbdelete" => db::delete(state, context, command),
        "dbfirst" => db::first(state, context, command),
        "dbnext" => db::next(state, context, command),
        "dbreset" => db::reset(state, context, &command),

        "createforwarder" => forward::create(state, context, command).await,
        "stopforwarder" => forward::stop(state, context, command),
        "killforwarders" => forward::kill_all(state, context, &command),
        "createtmpfile" => forward::create_tmp_file(state, context, command),
        "deletetmpfile" => forward::delete_tmp_file(state, context, command).await,
        "mpich1readint" => forward::read_int(state, context, command),

        "validate" => admin::validate(state, context, command),

        verb => {
            warn!(conn = %context.id(), peer = context.peer(), verb, "unknown ring command");
            Ok(())
        },
    }
}

fn from_right(state: &SharedState, context: &Context, command: &Command) {
    if command.verb() == "done" && command.arg(0).is_some_and(|a| a.eq_ignore_ascii_case("bounce")) {
        crate::ring::bounce(state, context);
    } else {
        warn!(conn = %context.id(), verb = command.verb(), "unexpected line on right link");
    }
}

/// Returns `true` if `command` came off the ring and started here.
#[must_use]
pub fn full_circle(state: &SharedState, context: &Context, command: &Command) -> bool {
    context.role() != Role::Console
        && command
            .get(keys::SRC)
            .is_some_and(|src| state.identity.matches(src))
}

/// Sends `command` to the right neighbor. Console requests are stamped with
/// `src` and `sock` first; ring requests travel unchanged.
pub fn forward(state: &SharedState, context: &Context, mut command: Command) {
    if context.role() == Role::Console {
        command.set(keys::SRC, state.identity.host());
        command.set(keys::SOCK, context.id().to_string());
    }
    state.ring.forward(command.to_line());
}

/// Forwards a broadcast verb unless it has come full circle. Returns `false`
/// when the caller should stop.
pub fn pass_along(state: &SharedState, context: &Context, command: &Command) -> bool {
    if full_circle(state, context, command) {
        return false;
    }
    forward(state, context, command.clone());
    true
}

/// Who receives the answer to a request.
#[derive(Debug, Clone)]
pub enum ReplyTo {
    /// The console the request arrived on.
    Console(Arc<Context>),
    /// A console on another node, reached by a routed result.
    Routed {
        /// Node holding the console.
        dest: String,
        /// Connection id of the console on `dest`.
        sock: String,
    },
    /// The request expects no answer.
    Nobody,
}

impl ReplyTo {
    /// Reply target of a request received on `context`.
    #[must_use]
    pub fn of(context: &Arc<Context>, command: &Command) -> Self {
        if context.role() == Role::Console {
            return Self::Console(Arc::clone(context));
        }
        match (command.get(keys::SRC), command.get(keys::SOCK)) {
            (Some(dest), Some(sock)) => Self::Routed {
                dest: dest.to_string(),
                sock: sock.to_string(),
            },
            _ => Self::Nobody,
        }
    }

    /// Sends `text` as a `result`.
    pub fn send(&self, state: &SharedState, text: impl Into<String>) {
        self.send_as(state, "result", text);
    }

    /// Sends `text`, routing it with `verb` if it has to cross the ring.
    pub fn send_as(&self, state: &SharedState, verb: &str, text: impl Into<String>) {
        let text = text.into();
        match self {
            Self::Console(context) => {
                if !context.send(text) {
                    debug!(conn = %context.id(), "console went away before its reply");
                }
            },
            Self::Routed { dest, sock } => deliver(state, verb, dest, sock, text),
            Self::Nobody => debug!(verb, "dropping reply nobody waits for"),
        }
    }
}

/// Where a request aimed at one host should run.
#[derive(Debug)]
pub enum Route {
    /// Here; answer `ReplyTo`.
    Local(ReplyTo),
    /// Not here; pass it on.
    Forward,
    /// Nowhere on the ring; answer `ReplyTo` with a failure.
    NotFound(ReplyTo),
}

/// Routes a request whose target host is under `host_key`. A request without
/// a target runs locally.
#[must_use]
pub fn route(state: &SharedState, context: &Arc<Context>, command: &Command, host_key: &str) -> Route {
    match command.get(host_key) {
        Some(host) if !state.identity.matches(host) => {
            if full_circle(state, context, command) {
                Route::NotFound(ReplyTo::of(context, command))
            } else {
                Route::Forward
            }
        },
        _ => Route::Local(ReplyTo::of(context, command)),
    }
}

/// Hands `text` to connection `sock` on `dest`, locally or around the ring.
pub fn deliver(state: &SharedState, verb: &str, dest: &str, sock: &str, text: String) {
    if state.identity.matches(dest) {
        match state.registry.lookup(sock) {
            Some(context) => {
                context.send(text);
            },
            None => debug!(sock, "reply target is gone"),
        }
        return;
    }
    let routed = Command::new(verb)
        .with(keys::DEST, dest)
        .with(keys::SOCK, sock)
        .with(keys::SRC, state.identity.host())
        .with(keys::RESULT, text);
    state.ring.forward(routed.to_line());
}

/// Outcome of a routed message arriving from the ring.
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Addressed to this node.
    Here,
    /// Passed on to the right neighbor.
    Forwarded,
    /// Went all the way round without finding its destination.
    Dropped,
}

/// Forwards a `dest`-addressed message unless it is for this node.
pub fn arrive(state: &SharedState, command: &Command) -> Arrival {
    match command.get(keys::DEST) {
        Some(dest) if state.identity.matches(dest) => Arrival::Here,
        Some(dest) => {
            if command
                .get(keys::SRC)
                .is_some_and(|src| state.identity.matches(src))
            {
                warn!(verb = command.verb(), dest, "destination not on the ring, dropping");
                Arrival::Dropped
            } else {
                state.ring.forward(command.to_line());
                Arrival::Forwarded
            }
        },
        None => {
            warn!(verb = command.verb(), "routed message without destination");
            Arrival::Dropped
        },
    }
}

fn relay_result(state: &SharedState, command: &Command) {
    if arrive(state, command) != Arrival::Here {
        return;
    }
    let Some(sock) = command.get(keys::SOCK) else {
        warn!(verb = command.verb(), "result without sock");
        return;
    };
    match state.registry.lookup(sock) {
        Some(context) => {
            context.send(command.get(keys::RESULT).unwrap_or_default());
        },
        None => debug!(sock, "result target is gone"),
    }
}
