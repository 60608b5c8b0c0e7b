//! Hex transport of binary PDUs (`AT+CMGS` payloads, `+CMT:` bodies).

use bytes::Bytes;

use crate::error::Result;

/// Upper-case hex, as modems expect after the `>` prompt.
pub fn encode(pdu: &[u8]) -> String {
    hex::encode_upper(pdu)
}

/// Decode a hex PDU line. Characters that are not hex digits (spaces,
/// stray quotes) are skipped.
pub fn decode(text: &str) -> Result<Bytes> {
    let digits: String = text.chars().filter(char::is_ascii_hexdigit).collect();
    Ok(Bytes::from(hex::decode(digits)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;

    #[test]
    fn encode_is_upper_case() {
        assert_eq!(encode(&[0x07, 0x91, 0xAB]), "0791AB");
    }

    #[test]
    fn decode_skips_noise() {
        assert_eq!(decode("07 91ab").unwrap().as_ref(), &[0x07, 0x91, 0xAB]);
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn odd_length_rejected() {
        assert!(matches!(decode("079"), Err(ChatError::InvalidPdu(_))));
    }
}
