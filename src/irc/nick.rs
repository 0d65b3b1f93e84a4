/// Nick validation (RFC 2812 §2.3.1).
use crate::error::NickError;

fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "[]\\^{}-`_|".contains(c)
}

fn is_first_char(c: char) -> bool {
    c.is_ascii_alphabetic() || "[]\\`_^{|}".contains(c)
}

/// Make `nick` acceptable to an IRC server.
///
/// Coerce mode strips illegal characters, prefixes `M` when the first
/// character is not allowed to lead, and truncates to `max_len` when given
/// (callers pass the advertised NICKLEN only while connected). Throw mode
/// returns the first violation instead of changing anything.
pub fn get_valid_nick(
    nick: &str,
    throw_on_invalid: bool,
    max_len: Option<usize>,
) -> Result<String, NickError> {
    let mut n: String = nick.chars().filter(|c| is_nick_char(*c)).collect();
    if throw_on_invalid && n != nick {
        return Err(NickError::IllegalCharacters(nick.to_owned()));
    }

    if !n.chars().next().is_some_and(is_first_char) {
        if throw_on_invalid {
            return Err(NickError::BadFirstCharacter(nick.to_owned()));
        }
        n.insert(0, 'M');
    }

    if let Some(max) = max_len {
        // Only ASCII survives the filter, so byte length is char length.
        if n.len() > max {
            if throw_on_invalid {
                return Err(NickError::TooLong {
                    nick: nick.to_owned(),
                    max,
                });
            }
            n.truncate(max);
        }
    }

    Ok(n)
}

/// Cheap check used before forwarding PMs: does the target look like a nick at all?
pub fn is_valid_nick_start(nick: &str) -> bool {
    nick.chars().next().is_some_and(is_first_char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numeric_nick_gets_prefix() {
        assert_eq!(get_valid_nick("12345", false, None).unwrap(), "M12345");
    }

    #[test]
    fn illegal_characters_are_stripped() {
        assert_eq!(get_valid_nick("f+/\u{263b}oobar", false, None).unwrap(), "foobar");
    }

    #[test]
    fn truncates_to_advertised_length() {
        let nick = "abcdefghijklmnopqrst";
        assert_eq!(get_valid_nick(nick, false, Some(9)).unwrap(), "abcdefghi");
        assert_eq!(get_valid_nick(nick, false, None).unwrap(), nick);
    }

    #[test]
    fn throw_mode_reports_each_violation() {
        assert_eq!(
            get_valid_nick("f+oo", true, None),
            Err(NickError::IllegalCharacters("f+oo".into()))
        );
        assert_eq!(
            get_valid_nick("-dash", true, None),
            Err(NickError::BadFirstCharacter("-dash".into()))
        );
        assert_eq!(
            get_valid_nick("abcdefghijk", true, Some(9)),
            Err(NickError::TooLong { nick: "abcdefghijk".into(), max: 9 })
        );
    }

    #[test]
    fn valid_nick_is_untouched() {
        assert_eq!(get_valid_nick("[a]lice_", true, Some(9)).unwrap(), "[a]lice_");
    }

    #[test]
    fn empty_nick_becomes_m() {
        assert_eq!(get_valid_nick("", false, None).unwrap(), "M");
    }

    #[test]
    fn nick_start_check() {
        assert!(is_valid_nick_start("alice"));
        assert!(!is_valid_nick_start("#chan"));
        assert!(!is_valid_nick_start(""));
    }
}
