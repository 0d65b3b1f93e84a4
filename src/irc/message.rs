/// IRC line parsing and serialization.
///
/// Lines follow RFC 2812:
///   [`@`tags SPACE] [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Message tags are accepted and discarded; nothing in the connection core
/// consumes them. The `\r\n` terminator is handled by the codec.
use std::fmt;

/// Delimiter for CTCP payloads carried inside PRIVMSG/NOTICE text.
pub const CTCP_DELIM: char = '\u{1}';

/// A parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional source (`server.name` or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command or three-digit numeric (`PRIVMSG`, `001`, `433`).
    pub command: String,
    /// Parameters. The last one may have been a trailing param with spaces.
    pub params: Vec<String>,
}

/// Errors that can occur while parsing a line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("prefix or tags present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build an outbound line with no prefix.
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: None,
            command: command.to_owned(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a CTCP request (PRIVMSG) or reply (NOTICE) to `target`.
    pub fn ctcp(command: &str, target: &str, body: &str) -> Self {
        Self::new(command, [target.to_owned(), format!("{CTCP_DELIM}{body}{CTCP_DELIM}")])
    }

    /// Parse a single line (the trailing `\r\n` is tolerated and stripped).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut rest = input.trim_end_matches(['\r', '\n']).trim_start_matches(' ');

        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        if rest.starts_with('@') {
            rest = match rest.find(' ') {
                Some(idx) => rest[idx + 1..].trim_start_matches(' '),
                None => return Err(ParseError::MissingCommand),
            };
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let idx = stripped.find(' ').ok_or(ParseError::MissingCommand)?;
            let prefix = stripped[..idx].to_owned();
            rest = stripped[idx + 1..].trim_start_matches(' ');
            Some(prefix)
        } else {
            None
        };

        let (command, mut remaining) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.find(' ') {
                Some(idx) => {
                    params.push(remaining[..idx].to_owned());
                    remaining = &remaining[idx + 1..];
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Serialize to wire format (without `\r\n`).
    ///
    /// The final parameter is only given a `:` when it needs one, so that
    /// servers which are strict about `JOIN #chan key` still accept it.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }

        out
    }

    /// Nick of the sender, or `None` for server-originated lines.
    ///
    /// `nick!user@host` yields `nick`. A bare prefix is treated as a nick
    /// unless it looks like a hostname (contains a dot).
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        match prefix.split_once('!') {
            Some((nick, _)) => Some(nick),
            None if prefix.contains('.') => None,
            None => Some(prefix),
        }
    }

    /// Parameter at `idx`, or `""`.
    pub fn param(&self, idx: usize) -> &str {
        self.params.get(idx).map(String::as_str).unwrap_or("")
    }

    /// True for three-digit numeric replies.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// CTCP body of a PRIVMSG/NOTICE, if the text is wrapped in `\x01`.
    pub fn ctcp_body(&self) -> Option<&str> {
        let text = self.params.get(1)?;
        let inner = text.strip_prefix(CTCP_DELIM)?;
        Some(inner.strip_suffix(CTCP_DELIM).unwrap_or(inner))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// RFC 1459 case folding: ASCII lowercase plus `[]\~` → `{}|^`.
pub fn irc_lowercase(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_command_with_trailing() {
        let msg = Message::parse("PRIVMSG #bridge :Hello everyone!").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#bridge", "Hello everyone!"]);
    }

    #[test]
    fn parse_numeric_with_prefix() {
        let msg = Message::parse(":irc.example.org 001 alice :Welcome").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("irc.example.org"));
        assert_eq!(msg.numeric(), Some(1));
        assert_eq!(msg.params, vec!["alice", "Welcome"]);
    }

    #[test]
    fn parse_skips_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z :a!b@c JOIN #x").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("a!b@c"));
        assert_eq!(msg.command, "JOIN");
    }

    #[test]
    fn parse_collapses_repeated_spaces() {
        let msg = Message::parse(":srv  MODE   #x  +o  bob").unwrap();
        assert_eq!(msg.params, vec!["#x", "+o", "bob"]);
    }

    #[test]
    fn parse_uppercases_command() {
        let msg = Message::parse("ping :token").unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn parse_rejects_empty_and_prefix_only() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":lonely.prefix"), Err(ParseError::MissingCommand));
        assert_eq!(Message::parse("@tag=only"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn parse_trailing_keeps_colons() {
        let msg = Message::parse("PRIVMSG #x :::ok").unwrap();
        assert_eq!(msg.params, vec!["#x", "::ok"]);
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn join_with_key_has_no_colon() {
        let msg = Message::new("JOIN", ["#secret", "hunter2"]);
        assert_eq!(msg.to_wire(), "JOIN #secret hunter2");
    }

    #[test]
    fn trailing_with_spaces_gets_colon() {
        let msg = Message::new("PRIVMSG", ["#x", "hello there"]);
        assert_eq!(msg.to_wire(), "PRIVMSG #x :hello there");
    }

    #[test]
    fn empty_trailing_gets_colon() {
        let msg = Message::new("TOPIC", ["#x", ""]);
        assert_eq!(msg.to_wire(), "TOPIC #x :");
    }

    // ── Helpers ──────────────────────────────────────────────────

    #[test]
    fn source_nick_variants() {
        let user = Message::parse(":alice!a@host PRIVMSG #x :hi").unwrap();
        assert_eq!(user.source_nick(), Some("alice"));

        let server = Message::parse(":irc.example.org NOTICE * :hi").unwrap();
        assert_eq!(server.source_nick(), None);

        let bare = Message::parse(":alice QUIT :bye").unwrap();
        assert_eq!(bare.source_nick(), Some("alice"));
    }

    #[test]
    fn ctcp_body_extraction() {
        let msg = Message::parse(":a!b@c PRIVMSG #x :\u{1}ACTION waves\u{1}").unwrap();
        assert_eq!(msg.ctcp_body(), Some("ACTION waves"));

        let plain = Message::parse(":a!b@c PRIVMSG #x :hello").unwrap();
        assert_eq!(plain.ctcp_body(), None);
    }

    #[test]
    fn rfc1459_casefold() {
        assert_eq!(irc_lowercase("#Foo[Bar]\\~"), "#foo{bar}|^");
    }
}
