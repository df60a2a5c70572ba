//! Payload ↔ query name encoding.
//!
//! Payload bytes are encoded with the base32 extended-hex alphabet (no
//! padding), split into labels of at most 63 characters and suffixed with
//! the root domain: `<label>.<label>.<root>.`

use data_encoding::BASE32HEX_NOPAD;

use crate::error::{Result, TunnelError};

/// Longest label the DNS wire format allows.
pub const MAX_LABEL_LEN: usize = 63;

/// Longest name the DNS wire format allows, length bytes included.
pub const MAX_NAME_LEN: usize = 255;

/// Smallest usable payload size (minimal IPv4 MTU).
pub const MIN_MTU: usize = 68;

/// Normalize a configured root domain: no leading/trailing dots, lowercase.
pub fn normalize_root(root: &str) -> Result<String> {
    let root = root.trim().trim_matches('.').to_ascii_lowercase();
    if root.is_empty() {
        return Err(TunnelError::Config("dns root_domain is empty".into()));
    }
    if root.split('.').any(|label| label.is_empty() || label.len() > MAX_LABEL_LEN) {
        return Err(TunnelError::Config(format!(
            "dns root_domain {root} has an invalid label"
        )));
    }
    Ok(root)
}

/// Wire length of the query name carrying `payload_len` bytes under `root`.
pub fn encoded_name_len(payload_len: usize, root: &str) -> usize {
    let encoded = BASE32HEX_NOPAD.encode_len(payload_len);
    let data_labels = encoded.div_ceil(MAX_LABEL_LEN);
    // length byte per data label, the root labels, and the terminating zero
    encoded + data_labels + root.len() + 1 + 1
}

/// Largest payload whose query name still fits in [`MAX_NAME_LEN`].
pub fn max_payload_len(root: &str) -> usize {
    let mut candidate = 0;
    while encoded_name_len(candidate + 1, root) <= MAX_NAME_LEN {
        candidate += 1;
    }
    candidate
}

/// Encode a payload into a fully qualified query name.
pub fn encode_query_name(payload: &[u8], root: &str) -> String {
    let encoded = BASE32HEX_NOPAD.encode(payload);
    let mut name = String::with_capacity(encoded.len() + root.len() + 8);
    for chunk in encoded.as_bytes().chunks(MAX_LABEL_LEN) {
        // base32 output is ASCII
        name.push_str(&String::from_utf8_lossy(chunk));
        name.push('.');
    }
    name.push_str(root);
    name.push('.');
    name
}

/// Decode the payload from the labels of a query name.
///
/// Returns `None` if the name is not below `root`. Decoding ignores case,
/// since resolvers are free to alter it.
pub fn decode_query_labels(labels: &[String], root: &str) -> Option<Result<Vec<u8>>> {
    let root_labels: Vec<&str> = root.split('.').collect();
    if labels.len() < root_labels.len() {
        return None;
    }
    let (data, suffix) = labels.split_at(labels.len() - root_labels.len());
    let under_root = suffix
        .iter()
        .zip(&root_labels)
        .all(|(label, root_label)| label.eq_ignore_ascii_case(root_label));
    if !under_root {
        return None;
    }

    let encoded = data.concat().to_ascii_uppercase();
    Some(
        BASE32HEX_NOPAD
            .decode(encoded.as_bytes())
            .map_err(|e| TunnelError::Dns(format!("invalid payload label: {e}"))),
    )
}

/// Encode a payload for a TXT answer.
pub fn encode_text(payload: &[u8]) -> String {
    BASE32HEX_NOPAD.encode(payload)
}

/// Decode a TXT answer.
pub fn decode_text(text: &[u8]) -> Result<Vec<u8>> {
    BASE32HEX_NOPAD
        .decode(&text.to_ascii_uppercase())
        .map_err(|e| TunnelError::Dns(format!("invalid TXT payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "t.example";

    fn labels(name: &str) -> Vec<String> {
        name.trim_end_matches('.')
            .split('.')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(".T.Example.").unwrap(), "t.example");
        assert!(normalize_root("..").is_err());
        assert!(normalize_root("a..b").is_err());
    }

    #[test]
    fn test_mtu_for_root() {
        // 240 base32 chars in 4 labels + "t.example" = 255 wire bytes
        assert_eq!(max_payload_len(ROOT), 150);
        assert_eq!(encoded_name_len(150, ROOT), 255);
        assert!(encoded_name_len(151, ROOT) > MAX_NAME_LEN);
    }

    #[test]
    fn test_mtu_boundary_name_fits() {
        let mtu = max_payload_len(ROOT);
        let name = encode_query_name(&vec![0xa5; mtu], ROOT);
        let wire_len: usize = labels(&name).iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        assert!(wire_len <= MAX_NAME_LEN);
        assert!(labels(&name).iter().all(|l| l.len() <= MAX_LABEL_LEN));
    }

    #[test]
    fn test_long_root_lowers_mtu() {
        let root = format!("{}.example", "r".repeat(60));
        assert!(max_payload_len(&root) < max_payload_len(ROOT));
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload: Vec<u8> = (0..=149u8).collect();
        let name = encode_query_name(&payload, ROOT);
        let decoded = decode_query_labels(&labels(&name), ROOT).unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_ignores_case() {
        let name = encode_query_name(b"\x45\x00\x00\x1c", ROOT).to_ascii_lowercase();
        let decoded = decode_query_labels(&labels(&name), "T.EXAMPLE").unwrap().unwrap();
        assert_eq!(decoded, b"\x45\x00\x00\x1c");
    }

    #[test]
    fn test_name_outside_root() {
        assert!(decode_query_labels(&labels("abc.other.example."), ROOT).is_none());
        assert!(decode_query_labels(&labels("example."), ROOT).is_none());
    }

    #[test]
    fn test_empty_payload_is_root_only() {
        assert_eq!(encode_query_name(&[], ROOT), "t.example.");
        let decoded = decode_query_labels(&labels("t.example."), ROOT).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_invalid_label_is_an_error() {
        let result = decode_query_labels(&labels("zzzz!.t.example."), ROOT).unwrap();
        assert!(matches!(result, Err(TunnelError::Dns(_))));
    }
}
