/// Numeric error replies and how the connection core reacts to them.

use std::fmt;

/// The 4xx/5xx numerics the bridge cares about. Anything else in that
/// range is carried as [`ErrorReply::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReply {
    NoSuchNick,
    NoSuchChannel,
    CannotSendToChan,
    TooManyChannels,
    UnknownCommand,
    NoNicknameGiven,
    ErroneousNickname,
    NicknameInUse,
    BanOnChan,
    NickCollision,
    UnavailResource,
    NickTooFast,
    UserNotInChannel,
    NotOnChannel,
    UserOnChannel,
    NotRegistered,
    AlreadyRegistered,
    PasswdMismatch,
    NoPermForHost,
    YoureBannedCreep,
    YouWillBeBanned,
    ChannelIsFull,
    InviteOnlyChan,
    BannedFromChan,
    BadChannelKey,
    NeedReggedNick,
    NoPrivileges,
    ChanOpPrivsNeeded,
    NoOperHost,
    NoNonReg,
    UmodeUnknownFlag,
    Other(u16),
}

impl ErrorReply {
    /// Map a numeric to a reply kind; `None` outside the error range.
    pub fn from_numeric(code: u16) -> Option<Self> {
        let reply = match code {
            401 => Self::NoSuchNick,
            403 => Self::NoSuchChannel,
            404 => Self::CannotSendToChan,
            405 => Self::TooManyChannels,
            421 => Self::UnknownCommand,
            431 => Self::NoNicknameGiven,
            432 => Self::ErroneousNickname,
            433 => Self::NicknameInUse,
            435 => Self::BanOnChan,
            436 => Self::NickCollision,
            437 => Self::UnavailResource,
            438 => Self::NickTooFast,
            441 => Self::UserNotInChannel,
            442 => Self::NotOnChannel,
            443 => Self::UserOnChannel,
            451 => Self::NotRegistered,
            462 => Self::AlreadyRegistered,
            463 => Self::NoPermForHost,
            464 => Self::PasswdMismatch,
            465 => Self::YoureBannedCreep,
            466 => Self::YouWillBeBanned,
            471 => Self::ChannelIsFull,
            473 => Self::InviteOnlyChan,
            474 => Self::BannedFromChan,
            475 => Self::BadChannelKey,
            477 => Self::NeedReggedNick,
            481 => Self::NoPrivileges,
            482 => Self::ChanOpPrivsNeeded,
            491 => Self::NoOperHost,
            492 => Self::NoNonReg,
            501 => Self::UmodeUnknownFlag,
            400..=599 => Self::Other(code),
            _ => return None,
        };
        Some(reply)
    }

    /// Errors that end the session. Everything else is surfaced as an
    /// event and the connection stays up.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NoPermForHost | Self::YoureBannedCreep | Self::YouWillBeBanned
        )
    }

    /// Join rejections that no amount of retrying will fix.
    pub fn is_terminal_join_failure(self) -> bool {
        matches!(
            self,
            Self::NoSuchChannel
                | Self::TooManyChannels
                | Self::ChannelIsFull
                | Self::InviteOnlyChan
                | Self::BannedFromChan
                | Self::BadChannelKey
                | Self::NeedReggedNick
        )
    }

    /// Replies that reject an explicit NICK change.
    pub fn is_nick_failure(self) -> bool {
        matches!(
            self,
            Self::BanOnChan
                | Self::NickCollision
                | Self::NicknameInUse
                | Self::ErroneousNickname
                | Self::NoNicknameGiven
                | Self::NickTooFast
                | Self::UnavailResource
        )
    }

    /// Errors the user must hear about even when connection notices are off.
    pub fn is_forced_notice(self) -> bool {
        matches!(
            self,
            Self::NoNonReg | Self::NoSuchNick | Self::CannotSendToChan
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoSuchNick => "err_nosuchnick",
            Self::NoSuchChannel => "err_nosuchchannel",
            Self::CannotSendToChan => "err_cannotsendtochan",
            Self::TooManyChannels => "err_toomanychannels",
            Self::UnknownCommand => "err_unknowncommand",
            Self::NoNicknameGiven => "err_nonicknamegiven",
            Self::ErroneousNickname => "err_erroneusnickname",
            Self::NicknameInUse => "err_nicknameinuse",
            Self::BanOnChan => "err_banonchan",
            Self::NickCollision => "err_nickcollision",
            Self::UnavailResource => "err_unavailresource",
            Self::NickTooFast => "err_nicktoofast",
            Self::UserNotInChannel => "err_usernotinchannel",
            Self::NotOnChannel => "err_notonchannel",
            Self::UserOnChannel => "err_useronchannel",
            Self::NotRegistered => "err_notregistered",
            Self::AlreadyRegistered => "err_alreadyregistred",
            Self::PasswdMismatch => "err_passwdmismatch",
            Self::NoPermForHost => "err_nopermforhost",
            Self::YoureBannedCreep => "err_yourebannedcreep",
            Self::YouWillBeBanned => "err_youwillbebanned",
            Self::ChannelIsFull => "err_channelisfull",
            Self::InviteOnlyChan => "err_inviteonlychan",
            Self::BannedFromChan => "err_bannedfromchan",
            Self::BadChannelKey => "err_badchannelkey",
            Self::NeedReggedNick => "err_needreggednick",
            Self::NoPrivileges => "err_noprivileges",
            Self::ChanOpPrivsNeeded => "err_chanoprivsneeded",
            Self::NoOperHost => "err_nooperhost",
            Self::NoNonReg => "err_nononreg",
            Self::UmodeUnknownFlag => "err_umodeunknownflag",
            Self::Other(_) => "err_unknown",
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "err_{code}"),
            other => f.write_str(other.name()),
        }
    }
}
