//! Passphrase validation and the mpd-user launch account.

use std::sync::Arc;

use mpd_core::auth;
use mpd_core::config::{ConfigError, names};
use mpd_core::wire::{Command, keys, reply};
use tracing::{info, warn};

use super::status;
use crate::protocol::dispatch::{Route, forward, route};
use crate::protocol::{Context, ProtocolResult};
use crate::state::SharedState;

/// `validate [host=H] phrase=P`: does `P` match the node's passphrase.
pub fn validate(state: &SharedState, context: &Arc<Context>, command: Command) -> ProtocolResult<()> {
    match route(state, context, &command, keys::HOST) {
        Route::Local(reply_to) => {
            let valid = command
                .get(keys::PHRASE)
                .is_some_and(|phrase| auth::phrase_matches(&state.config.phrase(), phrase));
            reply_to.send(state, status(valid));
        },
        Route::Forward => forward(state, context, command),
        Route::NotFound(reply_to) => reply_to.send(state, reply::BAD_HOSTNAME),
    }
    Ok(())
}

/// `setmpduser a=ACCOUNT p=HEXPW`.
///
/// `p=` must be well-formed hex. It is not stored.
pub fn set_mpd_user(state: &SharedState, context: &Context, command: &Command) -> ProtocolResult<()> {
    let Some(account) = command.get(keys::ACCOUNT).filter(|a| !a.is_empty()) else {
        return context.reply(reply::FAIL);
    };
    let password = command.get(keys::PASSWORD).unwrap_or_default();
    if auth::decode_password(password).is_none() {
        return context.reply(reply::FAIL);
    }
    let result = state.config.update(|config| {
        config.mpd_user = Some(account.to_string());
        config.mpd_user_password = None;
        Ok(())
    });
    respond(context, "setmpduser", result)
}

/// `clrmpduser`: forget the account and stop using it.
pub fn clear_mpd_user(state: &SharedState, context: &Context) -> ProtocolResult<()> {
    let result = state.config.update(|config| {
        config.mpd_user = None;
        config.mpd_user_password = None;
        config.use_mpd_user = false;
        Ok(())
    });
    respond(context, "clrmpduser", result)
}

/// `enablempduser` / `disablempduser`. Enabling needs an account first.
pub fn enable_mpd_user(state: &SharedState, context: &Context, enable: bool) -> ProtocolResult<()> {
    let result = state.config.update(|config| {
        if enable && config.mpd_user.is_none() {
            return Err(ConfigError::InvalidValue {
                key: names::USE_MPD_USER.to_string(),
                value: "yes".to_string(),
            });
        }
        config.use_mpd_user = enable;
        Ok(())
    });
    respond(context, if enable { "enablempduser" } else { "disablempduser" }, result)
}

fn respond(context: &Context, verb: &str, result: Result<(), ConfigError>) -> ProtocolResult<()> {
    match result {
        Ok(()) => {
            info!(verb, "mpd user updated");
            context.reply(reply::SUCCESS)
        },
        Err(e) => {
            warn!(verb, error = %e, "mpd user update failed");
            context.reply(reply::FAIL)
        },
    }
}
