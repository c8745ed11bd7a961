//! Line-oriented wire grammar shared by consoles and ring neighbors.
//!
//! Every message is one newline-terminated line:
//!
//! ```text
//! <verb> [positional ...] [key=value ...]
//! ```
//!
//! The verb is matched case-insensitively. A value containing spaces is
//! wrapped in single quotes (`c='/bin/echo hello'`); an unquoted value runs to
//! the next space. Keys keep their insertion order and the last occurrence of
//! a duplicated key wins.
//!
//! Lines travelling around the ring carry correlation keys (see [`keys`]) so
//! that the daemon that eventually answers can route the result back to the
//! console connection that asked.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum accepted line length in bytes.
///
/// Longer lines are a protocol error and drop the connection.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Reserved and commonly used keys.
pub mod keys {
    /// Host that originated a forwarded line.
    pub const SRC: &str = "src";
    /// Connection id at the originating host.
    pub const SOCK: &str = "sock";
    /// Host that must receive a routed result.
    pub const DEST: &str = "dest";
    /// Launch host-resolution attempt.
    pub const TRY: &str = "try";
    /// Launch id.
    pub const ID: &str = "id";
    /// Target host.
    pub const HOST: &str = "host";
    /// Target host for `launch`.
    pub const LAUNCH_HOST: &str = "h";
    /// Accumulated or routed result.
    pub const RESULT: &str = "result";
    pub const NAME: &str = "name";
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const COUNT: &str = "count";
    pub const PID: &str = "pid";
    pub const CODE: &str = "code";
    pub const TIME: &str = "time";
    pub const ERROR: &str = "error";
    pub const PORT: &str = "port";
    /// `host:port` a forwarder relays to.
    pub const FORWARD: &str = "forward";
    pub const FILE: &str = "file";
    /// `abort=yes` on `stopforwarder`.
    pub const ABORT: &str = "abort";
    pub const PHRASE: &str = "phrase";
    /// Launch and `setmpduser` account.
    pub const ACCOUNT: &str = "a";
    /// Hex-encoded password paired with [`ACCOUNT`].
    pub const PASSWORD: &str = "p";
}

/// Literal replies written to consoles.
pub mod reply {
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAIL: &str = "FAIL";
    pub const ACTIVE: &str = "ACTIVE";
    pub const NONE: &str = "none";
    pub const DBS_END: &str = "DBS_END";
    pub const UNKNOWN_PID: &str = "-1";
    /// A targeted command travelled the whole ring without meeting its host.
    pub const BAD_HOSTNAME: &str = "FAIL - bad hostname";
    pub const INVALID_HOST: &str = "invalid host";
    pub const UNKNOWN_COMMAND: &str = "ERROR - unknown command";
    pub const INVALID_HOST_COUNT: &str = "Error: invalid number of hosts requested";
}

/// Errors produced while parsing a line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The line held no tokens.
    #[error("empty command line")]
    Empty,

    /// A quoted value was opened but never closed.
    #[error("unterminated quote in value starting at byte {offset}")]
    UnterminatedQuote {
        /// Byte offset of the opening quote.
        offset: usize,
    },

    /// A connection-type line was not `console`, `left <host>` or
    /// `right <host>`.
    #[error("invalid connection type: {line}")]
    InvalidConnectionType {
        /// The offending line.
        line: String,
    },
}

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<String>,
    fields: Vec<(String, String)>,
}

impl Command {
    /// Creates a command with the given verb and no arguments.
    #[must_use]
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into().to_ascii_lowercase(),
            args: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Parses one line.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Empty`] for a blank line and
    /// [`WireError::UnterminatedQuote`] for an unbalanced single quote.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut tokens = Tokenizer::new(line);
        let verb = match tokens.next_token()? {
            Some(Token::Word(verb)) => verb,
            // A leading `key=value` still names the verb by its full text.
            Some(Token::Pair(key, value)) => format!("{key}={value}"),
            None => return Err(WireError::Empty),
        };

        let mut command = Self::new(verb);
        while let Some(token) = tokens.next_token()? {
            match token {
                Token::Word(word) => command.args.push(word),
                Token::Pair(key, value) => command.set(key, value),
            }
        }
        Ok(command)
    }

    /// The lowercased verb.
    #[must_use]
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Positional argument `index`, counting from the first token after the
    /// verb.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value under `key` parsed as `T`, or `None` when missing or
    /// malformed.
    #[must_use]
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Returns positional argument `index` or, failing that, the value under
    /// `key`. Several verbs accept both `getpid 7` and `getpid id=7`.
    #[must_use]
    pub fn arg_or(&self, index: usize, key: &str) -> Option<&str> {
        self.arg(index).or_else(|| self.get(key))
    }

    /// Sets `key` to `value`, replacing an earlier value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Builder form of [`Command::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(index).1)
    }

    /// Iterates over `key=value` fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes the command back into a single line (without the newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        for (key, value) in &self.fields {
            write!(f, " {key}={}", quote(value))?;
        }
        Ok(())
    }
}

impl FromStr for Command {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Quotes `value` when it would not survive as a bare token.
///
/// The grammar has no escape for a single quote inside a quoted value, so
/// embedded quotes are rewritten as double quotes.
#[must_use]
pub fn quote(value: &str) -> String {
    if value.contains([' ', '\t']) || value.starts_with('\'') {
        format!("'{}'", value.replace('\'', "\""))
    } else {
        value.to_string()
    }
}

enum Token {
    Word(String),
    Pair(String, String),
}

struct Tokenizer<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    const fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn skip_spaces(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start_matches([' ', '\t', '\r']).len();
    }

    fn next_token(&mut self) -> Result<Option<Token>, WireError> {
        self.skip_spaces();
        let rest = self.rest();
        if rest.is_empty() {
            return Ok(None);
        }

        let head_len = rest.find([' ', '\t']).unwrap_or(rest.len());
        let head = &rest[..head_len];
        if !head.starts_with('\'') {
            if let Some(eq) = head.find('=').filter(|&eq| eq > 0) {
                let key = head[..eq].to_string();
                self.pos += eq + 1;
                let value = self.take_value()?;
                return Ok(Some(Token::Pair(key, value)));
            }
        }
        self.take_value().map(|word| Some(Token::Word(word)))
    }

    fn take_value(&mut self) -> Result<String, WireError> {
        let rest = self.rest();
        if let Some(quoted) = rest.strip_prefix('\'') {
            let close = quoted
                .find('\'')
                .ok_or(WireError::UnterminatedQuote { offset: self.pos })?;
            self.pos += close + 2;
            return Ok(quoted[..close].to_string());
        }
        let end = rest.find([' ', '\t']).unwrap_or(rest.len());
        self.pos += end;
        Ok(rest[..end].trim_end_matches('\r').to_string())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_verb_positionals_and_fields() {
        let cmd = Command::parse("GetPid 7 host=node1").unwrap();
        assert_eq!(cmd.verb(), "getpid");
        assert_eq!(cmd.arg(0), Some("7"));
        assert_eq!(cmd.get("host"), Some("node1"));
        assert_eq!(cmd.get("missing"), None);
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let cmd = Command::parse("launch h=a c='/bin/echo hello world' e='A=1 B=2'").unwrap();
        assert_eq!(cmd.get("c"), Some("/bin/echo hello world"));
        assert_eq!(cmd.get("e"), Some("A=1 B=2"));
        assert_eq!(cmd.get("h"), Some("a"));
    }

    #[test]
    fn empty_value_is_allowed() {
        let cmd = Command::parse("set key= value=x").unwrap();
        assert_eq!(cmd.get("key"), Some(""));
        assert_eq!(cmd.get("value"), Some("x"));
    }

    #[test]
    fn last_duplicate_key_wins() {
        let cmd = Command::parse("hosts result=a result=b").unwrap();
        assert_eq!(cmd.get("result"), Some("b"));
        assert_eq!(cmd.fields().count(), 1);
    }

    #[test]
    fn multi_word_ring_messages() {
        let cmd = Command::parse("connect left hostB").unwrap();
        assert_eq!(cmd.verb(), "connect");
        assert_eq!(cmd.args(), ["left", "hostB"]);

        let cmd = Command::parse("done bounce").unwrap();
        assert_eq!(cmd.arg(0), Some("bounce"));
    }

    #[test]
    fn blank_and_unbalanced_lines_are_errors() {
        assert_eq!(Command::parse("   "), Err(WireError::Empty));
        assert!(matches!(
            Command::parse("launch c='oops"),
            Err(WireError::UnterminatedQuote { .. })
        ));
    }

    #[test]
    fn trailing_carriage_return_is_ignored() {
        let cmd = Command::parse("next 3\r").unwrap();
        assert_eq!(cmd.arg(0), Some("3"));
    }

    #[test]
    fn set_replaces_in_place_and_remove_drops() {
        let mut cmd = Command::new("launch").with("h", "a").with("c", "x");
        cmd.set("h", "b");
        assert_eq!(cmd.to_line(), "launch h=b c=x");
        assert_eq!(cmd.remove("h").as_deref(), Some("b"));
        assert_eq!(cmd.to_line(), "launch c=x");
    }

    #[test]
    fn arg_or_falls_back_to_key() {
        let cmd = Command::parse("getpid id=4").unwrap();
        assert_eq!(cmd.arg_or(0, "id"), Some("4"));
        assert_eq!(cmd.get_parsed::<u64>("id"), Some(4));
    }

    #[test]
    fn encoding_quotes_values_with_spaces() {
        let cmd = Command::new("dbresult").with("result", "key=k value=v");
        assert_eq!(cmd.to_line(), "dbresult result='key=k value=v'");
        let back = Command::parse(&cmd.to_line()).unwrap();
        assert_eq!(back.get("result"), Some("key=k value=v"));
    }

    #[test]
    fn encoding_quotes_values_with_tabs() {
        let cmd = Command::new("set").with("key", "k").with("value", "a\tb");
        assert_eq!(cmd.to_line(), "set key=k value='a\tb'");
        let back = Command::parse(&cmd.to_line()).unwrap();
        assert_eq!(back.get("value"), Some("a\tb"));
    }

    proptest! {
        #[test]
        fn encoded_fields_parse_back(
            verb in "[a-z]{1,10}",
            fields in proptest::collection::btree_map("[a-z][a-z0-9]{0,6}", "[a-zA-Z0-9=:,./ \t-]{0,24}", 0..6),
        ) {
            let mut cmd = Command::new(verb.clone());
            for (k, v) in &fields {
                cmd.set(k.clone(), v.clone());
            }
            let parsed = Command::parse(&cmd.to_line()).unwrap();
            prop_assert_eq!(parsed.verb(), verb.as_str());
            for (k, v) in &fields {
                prop_assert_eq!(parsed.get(k), Some(v.as_str()));
            }
        }
    }
}
