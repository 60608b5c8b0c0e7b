//! Conventional DLCI assignments.
//!
//! DLCI 0 carries control traffic only. Logical channels use 1..=63; the
//! lower ones have names modems commonly expect.

/// Multiplexer control channel.
pub const CONTROL: u8 = 0;

/// AT command channel.
pub const PRIMARY: u8 = 1;

/// Secondary command channel (SMS, SIM toolkit, ...).
pub const SECONDARY: u8 = 2;

/// Packet data and data-call setup.
pub const DATA: u8 = 3;

/// First auxiliary channel.
pub const AUX: u8 = 4;

/// Highest valid DLCI.
pub const MAX_CHANNEL: u8 = 63;

/// Conventional DLCI for a channel name, if the name has one.
///
/// `datasetup` shares the data channel, and every `aux*` name maps to
/// the auxiliary channel.
pub fn channel_for_name(name: &str) -> Option<u8> {
    match name {
        "primary" => Some(PRIMARY),
        "secondary" => Some(SECONDARY),
        "data" | "datasetup" => Some(DATA),
        _ if name.starts_with("aux") => Some(AUX),
        _ => None,
    }
}

/// Returns a human-readable name for a DLCI.
pub fn channel_name(id: u8) -> &'static str {
    match id {
        CONTROL => "control",
        PRIMARY => "primary",
        SECONDARY => "secondary",
        DATA => "data",
        AUX => "aux",
        5..=MAX_CHANNEL => "dynamic",
        _ => "invalid",
    }
}

/// Returns true if `id` can address a logical (non-control) channel.
pub fn is_logical(id: u8) -> bool {
    (1..=MAX_CHANNEL).contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_names() {
        assert_eq!(channel_for_name("primary"), Some(1));
        assert_eq!(channel_for_name("secondary"), Some(2));
        assert_eq!(channel_for_name("data"), Some(3));
        assert_eq!(channel_for_name("datasetup"), Some(3));
        assert_eq!(channel_for_name("aux"), Some(4));
        assert_eq!(channel_for_name("auxgps"), Some(4));
        assert_eq!(channel_for_name("voice"), None);
    }

    #[test]
    fn names_and_ranges() {
        assert_eq!(channel_name(CONTROL), "control");
        assert_eq!(channel_name(17), "dynamic");
        assert_eq!(channel_name(64), "invalid");
        assert!(!is_logical(CONTROL));
        assert!(is_logical(MAX_CHANNEL));
        assert!(!is_logical(64));
    }
}
