//! Text encodings used on key files and diagnostic output.

/// Base64 helpers, including serde adapters for keys stored in config files.
pub mod base64 {
    use serde::{Serialize, Serializer};

    #[derive(Debug, Eq, PartialEq)]
    pub struct DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        ::base64::decode(data.trim()).map_err(|_| DecodeError)
    }

    #[inline]
    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        encode(data).serialize(serializer)
    }
}

/// Hex helpers.
pub mod hex {
    #[derive(Debug, Eq, PartialEq)]
    pub struct DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::hex::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        ::hex::decode(data).map_err(|_| DecodeError)
    }
}

/// PEM body location. Tolerates a sloppy number of dashes around the BEGIN and
/// END labels, as long as there is at least one on each side.
pub mod pem {
    /// Locates the body of the first PEM block with the given type label and
    /// returns the base64 text between the markers.
    pub fn find_body<'a>(text: &'a str, type_label: &str) -> Option<&'a str> {
        let begin = find_marker(text, "BEGIN", type_label)?;
        let body_start = begin.1;

        let end = find_marker(&text[body_start..], "END", type_label)?;
        let body_end = body_start + end.0;

        Some(text[body_start..body_end].trim())
    }

    /// Decodes the body of the first PEM block with the given type label.
    pub fn decode_body(text: &str, type_label: &str) -> Option<Vec<u8>> {
        let body = find_body(text, type_label)?;
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        super::base64::decode(&compact).ok()
    }

    /// Finds `-----<verb> <label>-----` allowing any dash count >= 1 and
    /// returns (marker start, marker end) offsets into the text.
    fn find_marker(text: &str, verb: &str, type_label: &str) -> Option<(usize, usize)> {
        let label = format!("{} {}", verb, type_label);

        let mut search_from = 0;
        while let Some(rel) = text[search_from..].find(&label) {
            let at = search_from + rel;

            // Must be preceded by at least one dash
            let lead_dashes = text[..at].chars().rev().take_while(|&c| c == '-').count();
            if lead_dashes == 0 {
                search_from = at + label.len();
                continue;
            }

            // Must be followed by at least one dash
            let after = at + label.len();
            let tail_dashes = text[after..].chars().take_while(|&c| c == '-').count();
            if tail_dashes == 0 {
                search_from = after;
                continue;
            }

            let start = at - lead_dashes;
            let end = after + tail_dashes;
            return Some((start, end));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(base64::decode(&base64::encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_base64_invalid() {
        assert_eq!(base64::decode("not@@base64!"), Err(base64::DecodeError));
    }

    #[test]
    fn test_hex_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(hex::decode(&hex::encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_pem_find_body() {
        let text = "junk before\n-----BEGIN THING-----\naGVsbG8=\n-----END THING-----\njunk after";
        assert_eq!(pem::find_body(text, "THING"), Some("aGVsbG8="));
        assert_eq!(pem::decode_body(text, "THING").unwrap(), b"hello");
    }

    #[test]
    fn test_pem_tolerates_dash_count() {
        let text = "--BEGIN KEY---\nd29ybGQ=\n----END KEY--";
        assert_eq!(pem::decode_body(text, "KEY").unwrap(), b"world");
    }

    #[test]
    fn test_pem_missing_block() {
        assert_eq!(pem::find_body("no markers here", "KEY"), None);
        assert_eq!(pem::find_body("-----BEGIN KEY-----\nbody only", "KEY"), None);
    }

    #[test]
    fn test_pem_label_without_dashes_is_not_marker() {
        let text = "BEGIN KEY appears in prose\n-----BEGIN KEY-----\naGk=\n-----END KEY-----";
        assert_eq!(pem::decode_body(text, "KEY").unwrap(), b"hi");
    }
}
