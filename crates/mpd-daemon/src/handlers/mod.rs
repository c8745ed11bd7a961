//! Verb handlers, grouped by the state they touch.

pub mod admin;
pub mod db;
pub mod forward;
pub mod launch;
pub mod membership;
pub mod process;
pub mod store;

use mpd_core::wire::reply;

use crate::protocol::{Context, ProtocolResult, Role};

/// `SUCCESS` or `FAIL`.
const fn status(ok: bool) -> &'static str {
    if ok { reply::SUCCESS } else { reply::FAIL }
}

/// Replies on `context` if it is a console; ring requests get no answer.
fn answer_console(context: &Context, text: impl Into<String>) -> ProtocolResult<()> {
    if context.role() == Role::Console {
        context.reply(text)
    } else {
        Ok(())
    }
}
