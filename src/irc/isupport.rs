/// RFC 1459 nick length when the server does not advertise one.
pub const DEFAULT_NICK_LEN: usize = 9;

/// RPL_ISUPPORT (005) tracking.
///
/// Only the tokens the connection core acts on are kept: NICKLEN for nick
/// truncation, PREFIX for roster membership, CHANMODES to know which mode
/// letters carry an argument, and CHANTYPES for channel detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSupport {
    pub nick_len: Option<usize>,
    /// `(mode, symbol)` pairs, most powerful first.
    pub prefixes: Vec<(char, char)>,
    /// CHANMODES groups A (list), B (always arg), C (arg when set), D (never).
    pub chan_modes: [String; 4],
    pub chan_types: String,
}

impl Default for ServerSupport {
    fn default() -> Self {
        Self {
            nick_len: None,
            prefixes: vec![('o', '@'), ('v', '+')],
            chan_modes: [
                "beI".into(),
                "k".into(),
                "l".into(),
                "imnpstSr".into(),
            ],
            chan_types: "#&".into(),
        }
    }
}

/// One parsed mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub arg: Option<String>,
}

impl ServerSupport {
    /// Apply the tokens of one 005 line (`nick TOKEN TOKEN ... :are supported`).
    pub fn apply(&mut self, params: &[String]) {
        let end = params.len().saturating_sub(1);
        for token in params.iter().take(end).skip(1) {
            let (key, value) = token.split_once('=').unwrap_or((token.as_str(), ""));
            match key {
                "NICKLEN" | "MAXNICKLEN" => {
                    if let Ok(n) = value.parse() {
                        self.nick_len = Some(n);
                    }
                }
                "PREFIX" => {
                    if let Some(parsed) = parse_prefix(value) {
                        self.prefixes = parsed;
                    }
                }
                "CHANMODES" => {
                    let mut groups = value.splitn(4, ',');
                    for slot in self.chan_modes.iter_mut() {
                        *slot = groups.next().unwrap_or("").to_owned();
                    }
                }
                "CHANTYPES" if !value.is_empty() => self.chan_types = value.to_owned(),
                _ => {}
            }
        }
    }

    pub fn max_nick_len(&self) -> usize {
        self.nick_len.unwrap_or(DEFAULT_NICK_LEN)
    }

    pub fn is_channel(&self, target: &str) -> bool {
        target
            .chars()
            .next()
            .is_some_and(|c| self.chan_types.contains(c))
    }

    pub fn mode_for_prefix(&self, symbol: char) -> Option<char> {
        self.prefixes.iter().find(|(_, s)| *s == symbol).map(|(m, _)| *m)
    }

    pub fn prefix_for_mode(&self, mode: char) -> Option<char> {
        self.prefixes.iter().find(|(m, _)| *m == mode).map(|(_, s)| *s)
    }

    /// Lower rank is more powerful.
    fn rank(&self, symbol: char) -> usize {
        self.prefixes
            .iter()
            .position(|(_, s)| *s == symbol)
            .unwrap_or(usize::MAX)
    }

    /// The strongest membership symbol in `symbols`.
    pub fn strongest_prefix(&self, symbols: &str) -> Option<char> {
        symbols.chars().min_by_key(|c| self.rank(*c))
    }

    /// Split a NAMES entry such as `@+alice` into (`alice`, `@+`).
    pub fn split_membership<'a>(&self, entry: &'a str) -> (&'a str, &'a str) {
        let idx = entry
            .char_indices()
            .find(|(_, c)| self.rank(*c) == usize::MAX)
            .map(|(i, _)| i)
            .unwrap_or(entry.len());
        (&entry[idx..], &entry[..idx])
    }

    /// Walk a channel MODE's `+ov-k alice bob` into individual changes.
    pub fn parse_mode_changes(&self, modes: &str, args: &[String]) -> Vec<ModeChange> {
        let mut args = args.iter();
        let mut adding = true;
        let mut out = Vec::new();
        for mode in modes.chars() {
            match mode {
                '+' => adding = true,
                '-' => adding = false,
                _ => {
                    let takes_arg = self.prefix_for_mode(mode).is_some()
                        || self.chan_modes[0].contains(mode)
                        || self.chan_modes[1].contains(mode)
                        || (adding && self.chan_modes[2].contains(mode));
                    let arg = if takes_arg { args.next().cloned() } else { None };
                    out.push(ModeChange { adding, mode, arg });
                }
            }
        }
        out
    }
}

fn parse_prefix(value: &str) -> Option<Vec<(char, char)>> {
    let rest = value.strip_prefix('(')?;
    let (modes, symbols) = rest.split_once(')')?;
    if modes.chars().count() != symbols.chars().count() {
        return None;
    }
    Some(modes.chars().zip(symbols.chars()).collect())
}
