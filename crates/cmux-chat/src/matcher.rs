use std::collections::BTreeMap;

use crate::engine::NotificationId;

/// What an inbound line means, decided by its longest registered prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `OK`: the active command succeeded.
    OkTerminator,
    /// A final error line (`ERROR`, `+CME ERROR:`, registered error prefixes).
    Terminator,
    /// Kept as content, then the command completes as if `OK` followed.
    FuzzyTerminator,
    /// Ends dial/answer/hangup commands; a call notification otherwise.
    TerminatorOrNotification,
    /// Echo of a command we sent.
    CommandEcho,
    /// Unsolicited notification on one line.
    Notification(NotificationId),
    /// Unsolicited notification whose PDU follows on the next line.
    NotificationWithPdu(NotificationId),
}

/// Longest-prefix lookup table for inbound lines.
#[derive(Debug, Clone, Default)]
pub struct PrefixMatcher {
    entries: BTreeMap<String, LineKind>,
}

impl PrefixMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table every engine starts with.
    pub fn with_defaults() -> Self {
        let mut matcher = Self::new();
        matcher.add("OK", LineKind::OkTerminator);
        matcher.add("ERROR", LineKind::Terminator);
        matcher.add("+CME ERROR:", LineKind::Terminator);
        matcher.add("+CMS ERROR:", LineKind::Terminator);
        matcher.add("+EXT ERROR:", LineKind::Terminator);
        for word in ["CONNECT", "NO CARRIER", "NO ANSWER", "BUSY", "NO DIALTONE", "VCON"] {
            matcher.add(word, LineKind::TerminatorOrNotification);
        }
        matcher.add("AT", LineKind::CommandEcho);
        matcher
    }

    /// Add or replace a prefix.
    pub fn add(&mut self, prefix: &str, kind: LineKind) {
        self.entries.insert(prefix.to_string(), kind);
    }

    pub fn remove(&mut self, prefix: &str) -> Option<LineKind> {
        self.entries.remove(prefix)
    }

    /// Remove every prefix bound to a notification id.
    pub fn remove_notification(&mut self, id: NotificationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, kind| {
            !matches!(kind, LineKind::Notification(n) | LineKind::NotificationWithPdu(n) if *n == id)
        });
        self.entries.len() != before
    }

    /// Kind of the longest registered prefix of `line`, with that prefix.
    pub fn lookup<'a>(&'a self, line: &str) -> Option<(&'a str, LineKind)> {
        (1..=line.len())
            .rev()
            .filter(|&end| line.is_char_boundary(end))
            .find_map(|end| self.entries.get_key_value(&line[..end]))
            .map(|(prefix, kind)| (prefix.as_str(), *kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut matcher = PrefixMatcher::with_defaults();
        matcher.add("+CME ERROR: 515", LineKind::FuzzyTerminator);

        assert_eq!(
            matcher.lookup("+CME ERROR: 515").map(|(_, k)| k),
            Some(LineKind::FuzzyTerminator)
        );
        assert_eq!(
            matcher.lookup("+CME ERROR: 10").map(|(_, k)| k),
            Some(LineKind::Terminator)
        );
        assert_eq!(
            matcher.lookup("AT+CSQ").map(|(_, k)| k),
            Some(LineKind::CommandEcho)
        );
        assert_eq!(matcher.lookup("+CSQ: 21,99"), None);
    }

    #[test]
    fn notifications_registered_and_removed() {
        let mut matcher = PrefixMatcher::with_defaults();
        let id = NotificationId(7);
        matcher.add("+CREG:", LineKind::Notification(id));
        matcher.add("+CMT:", LineKind::NotificationWithPdu(id));

        assert_eq!(
            matcher.lookup("+CREG: 1"),
            Some(("+CREG:", LineKind::Notification(id)))
        );
        assert!(matcher.remove_notification(id));
        assert_eq!(matcher.lookup("+CREG: 1"), None);
        assert_eq!(matcher.lookup("+CMT: ,23"), None);
        assert!(!matcher.remove_notification(id));
    }

    #[test]
    fn multibyte_lines_do_not_split_chars() {
        let matcher = PrefixMatcher::with_defaults();
        assert_eq!(matcher.lookup("é OK"), None);
        assert_eq!(
            matcher.lookup("OK é").map(|(_, k)| k),
            Some(LineKind::OkTerminator)
        );
    }
}
