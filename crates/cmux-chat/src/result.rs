use std::fmt;

/// Final status of an AT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Connect,
    NoCarrier,
    Error,
    NoDialtone,
    Busy,
    NoAnswer,
    /// `+CME ERROR: <n>` (27.007 equipment errors).
    CmeError(u16),
    /// `+CMS ERROR: <n>` (27.005 message service errors).
    CmsError(u16),
    /// `+EXT ERROR: <n>`.
    ExtError(u16),
    /// No terminal line arrived within the command timeout.
    Timeout,
    /// The device stopped responding; every queued command fails with this.
    Dead,
    /// The channel carrying the command was closed.
    ChannelClosed,
    /// The physical link was lost.
    LinkDown,
}

const BASIC_CODES: &[(&str, ResultCode)] = &[
    ("OK", ResultCode::Ok),
    ("0", ResultCode::Ok),
    ("CONNECT", ResultCode::Connect),
    ("1", ResultCode::Connect),
    ("NO CARRIER", ResultCode::NoCarrier),
    ("3", ResultCode::NoCarrier),
    ("ERROR", ResultCode::Error),
    ("4", ResultCode::Error),
    ("NO DIALTONE", ResultCode::NoDialtone),
    ("6", ResultCode::NoDialtone),
    ("BUSY", ResultCode::Busy),
    ("7", ResultCode::Busy),
    ("NO ANSWER", ResultCode::NoAnswer),
    ("8", ResultCode::NoAnswer),
    ("VCON", ResultCode::Ok),
];

const CME_TEXT: &[(u16, &str)] = &[
    (0, "phone failure"),
    (1, "no connection to phone"),
    (2, "phone-adaptor link reserved"),
    (3, "operation not allowed"),
    (4, "operation not supported"),
    (5, "PH-SIM PIN required"),
    (6, "PH-FSIM PIN required"),
    (7, "PH-FSIM PUK required"),
    (10, "SIM not inserted"),
    (11, "SIM PIN required"),
    (12, "SIM PUK required"),
    (13, "SIM failure"),
    (14, "SIM busy"),
    (15, "SIM wrong"),
    (16, "incorrect password"),
    (17, "SIM PIN2 required"),
    (18, "SIM PUK2 required"),
    (20, "memory full"),
    (21, "invalid index"),
    (22, "not found"),
    (23, "memory failure"),
    (24, "text string too long"),
    (25, "invalid characters in text string"),
    (26, "dial string too long"),
    (27, "invalid characters in dial string"),
    (30, "no network service"),
    (31, "network timeout"),
    (32, "network not allowed - emergency calls only"),
    (40, "network personalization PIN required"),
    (41, "network personalization PUK required"),
    (42, "network subset personalization PIN required"),
    (43, "network subset personalization PUK required"),
    (44, "service provider personalization PIN required"),
    (45, "service provider personalization PUK required"),
    (46, "corporate personalization PIN required"),
    (47, "corporate personalization PUK required"),
    (48, "hidden key required"),
    (100, "unknown"),
    (103, "Illegal MS"),
    (106, "Illegal ME"),
    (107, "GPRS services not allowed"),
    (111, "PLMN not allowed"),
    (112, "Location area not allowed"),
    (113, "Roaming not allowed in this location area"),
    (132, "service option not supported"),
    (133, "requested service option not subscribed"),
    (134, "service option temporarily out of order"),
    (148, "unspecified GPRS error"),
    (149, "PDP authentication failure"),
    (150, "invalid mobile class"),
];

const CMS_TEXT: &[(u16, &str)] = &[
    (300, "ME failure"),
    (301, "SMS service of ME reserved"),
    (302, "operation not allowed"),
    (303, "operation not supported"),
    (304, "invalid PDU mode parameter"),
    (305, "invalid text mode parameter"),
    (310, "(U)SIM not inserted"),
    (311, "(U)SIM PIN required"),
    (312, "PH-(U)SIM PIN required"),
    (313, "(U)SIM failure"),
    (314, "(U)SIM busy"),
    (315, "(U)SIM wrong"),
    (316, "(U)SIM PUK required"),
    (317, "(U)SIM PIN2 required"),
    (318, "(U)SIM PUK2 required"),
    (320, "memory failure"),
    (321, "invalid memory index"),
    (322, "memory full"),
    (330, "SMSC address unknown"),
    (331, "no network service"),
    (332, "network timeout"),
    (340, "no +CNMA acknowledgement expected"),
    (500, "unknown error"),
];

/// Case-insensitive prefix match that must end at the line end or a space.
fn matches_word(line: &str, word: &str) -> bool {
    line.len() >= word.len()
        && line.as_bytes()[..word.len()].eq_ignore_ascii_case(word.as_bytes())
        && matches!(line.as_bytes().get(word.len()), None | Some(b' '))
}

fn leading_number(value: &str) -> Option<u16> {
    let digits: &str = &value[..value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len())];
    digits.parse().ok()
}

fn lookup_text(table: &[(u16, &str)], text: &str) -> Option<u16> {
    table
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(text))
        .map(|(code, _)| *code)
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

impl ResultCode {
    /// Classify a terminal result line. Unrecognised lines count as `Error`,
    /// which covers registered modem-specific error prefixes.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if let Some(rest) = strip_prefix_ignore_case(line, "+CME ERROR:") {
            let rest = rest.trim();
            return leading_number(rest)
                .or_else(|| lookup_text(CME_TEXT, rest))
                .map_or(Self::Error, Self::CmeError);
        }
        if let Some(rest) = strip_prefix_ignore_case(line, "+EXT ERROR:") {
            return leading_number(rest.trim()).map_or(Self::Error, Self::ExtError);
        }
        if let Some(rest) = strip_prefix_ignore_case(line, "+CMS ERROR:") {
            let rest = rest.trim();
            return leading_number(rest)
                .or_else(|| lookup_text(CMS_TEXT, rest))
                .map_or(Self::Error, Self::CmsError);
        }

        BASIC_CODES
            .iter()
            .find(|(word, _)| matches_word(line, word))
            .map_or(Self::Error, |(_, code)| *code)
    }

    /// True for `OK` and `CONNECT`.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Connect)
    }

    /// Synthetic result line for engine-generated codes.
    pub fn as_line(self) -> String {
        match self {
            Self::Ok => "OK".to_string(),
            Self::Connect => "CONNECT".to_string(),
            Self::NoCarrier => "NO CARRIER".to_string(),
            Self::Error => "ERROR".to_string(),
            Self::NoDialtone => "NO DIALTONE".to_string(),
            Self::Busy => "BUSY".to_string(),
            Self::NoAnswer => "NO ANSWER".to_string(),
            Self::CmeError(n) => format!("+CME ERROR: {n}"),
            Self::CmsError(n) => format!("+CMS ERROR: {n}"),
            Self::ExtError(n) => format!("+EXT ERROR: {n}"),
            Self::Timeout => "TIMEOUT".to_string(),
            Self::Dead => "DEAD".to_string(),
            Self::ChannelClosed => "CHANNEL CLOSED".to_string(),
            Self::LinkDown => "LINK DOWN".to_string(),
        }
    }

    /// Human-readable description, expanding numeric error codes.
    pub fn describe(self) -> String {
        let known = match self {
            Self::CmeError(n) => CME_TEXT.iter().find(|(code, _)| *code == n),
            Self::CmsError(n) => CMS_TEXT.iter().find(|(code, _)| *code == n),
            _ => None,
        };
        match known {
            Some((_, text)) => format!("{} ({text})", self.as_line()),
            None => self.as_line(),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_line())
    }
}

/// Everything a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The command line as sent.
    pub command: String,
    /// Response lines between the echo and the terminal line.
    pub lines: Vec<String>,
    /// The terminal line, or a synthetic one for engine-generated codes.
    pub result_line: String,
    pub code: ResultCode,
    /// Set when a dial was aborted; the command then never counts as ok.
    pub aborted: bool,
}

impl CommandResult {
    /// Build a result from the terminal line the modem sent.
    pub fn from_line(command: String, lines: Vec<String>, result_line: String) -> Self {
        let code = ResultCode::parse(&result_line);
        Self {
            command,
            lines,
            result_line,
            code,
            aborted: false,
        }
    }

    /// Build a result for a failure the engine generated itself.
    pub fn failed(command: String, lines: Vec<String>, code: ResultCode) -> Self {
        Self {
            command,
            lines,
            result_line: code.as_line(),
            code,
            aborted: false,
        }
    }

    pub fn ok(&self) -> bool {
        self.code.is_success() && !self.aborted
    }

    /// Response lines joined with newlines.
    pub fn content(&self) -> String {
        self.lines.join("\n")
    }

    /// Lines starting with `prefix`, with the prefix and leading spaces removed.
    pub fn values<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines
            .iter()
            .filter_map(move |line| line.strip_prefix(prefix))
            .map(str::trim_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_words_and_numbers() {
        assert_eq!(ResultCode::parse("OK"), ResultCode::Ok);
        assert_eq!(ResultCode::parse("0"), ResultCode::Ok);
        assert_eq!(ResultCode::parse("CONNECT 115200"), ResultCode::Connect);
        assert_eq!(ResultCode::parse("NO CARRIER"), ResultCode::NoCarrier);
        assert_eq!(ResultCode::parse("4"), ResultCode::Error);
        assert_eq!(ResultCode::parse("busy"), ResultCode::Busy);
        assert_eq!(ResultCode::parse("8"), ResultCode::NoAnswer);
        assert_eq!(ResultCode::parse("VCON"), ResultCode::Ok);
        // A word followed by something other than a space is not a match.
        assert_eq!(ResultCode::parse("OKAY"), ResultCode::Error);
    }

    #[test]
    fn extended_errors() {
        assert_eq!(ResultCode::parse("+CME ERROR: 10"), ResultCode::CmeError(10));
        assert_eq!(
            ResultCode::parse("+CME ERROR: SIM PIN required"),
            ResultCode::CmeError(11)
        );
        assert_eq!(ResultCode::parse("+CMS ERROR: 304"), ResultCode::CmsError(304));
        assert_eq!(
            ResultCode::parse("+cms error: memory full"),
            ResultCode::CmsError(322)
        );
        assert_eq!(ResultCode::parse("+EXT ERROR: 2"), ResultCode::ExtError(2));
        assert_eq!(ResultCode::parse("+CME ERROR: gibberish"), ResultCode::Error);
        assert_eq!(ResultCode::parse("+XERR: 12"), ResultCode::Error);
    }

    #[test]
    fn success_codes() {
        assert!(ResultCode::Ok.is_success());
        assert!(ResultCode::Connect.is_success());
        assert!(!ResultCode::Timeout.is_success());
        assert!(!ResultCode::CmeError(3).is_success());
    }

    #[test]
    fn describe_expands_known_codes() {
        assert_eq!(
            ResultCode::CmeError(10).describe(),
            "+CME ERROR: 10 (SIM not inserted)"
        );
        assert_eq!(ResultCode::CmeError(999).describe(), "+CME ERROR: 999");
        assert_eq!(ResultCode::Dead.to_string(), "DEAD");
    }

    #[test]
    fn aborted_result_is_not_ok() {
        let mut result =
            CommandResult::from_line("ATD123;".into(), Vec::new(), "CONNECT".into());
        assert!(result.ok());
        result.aborted = true;
        assert!(!result.ok());
    }

    #[test]
    fn values_strip_prefix() {
        let result = CommandResult::from_line(
            "AT+CSQ".into(),
            vec!["+CSQ: 21,99".into(), "junk".into()],
            "OK".into(),
        );
        assert_eq!(result.values("+CSQ:").collect::<Vec<_>>(), vec!["21,99"]);
        assert_eq!(result.content(), "+CSQ: 21,99\njunk");
    }
}
