//! txId/sandbox-subdomain helpers.
//!
//! The sandbox subdomain is the lowercase, unpadded RFC 4648 base32 encoding
//! of a txId's raw bytes. No crate in the dependency stack provides base32,
//! so this is hand-rolled: a small, fully specified transform rather than a
//! stand-in for a missing dependency.

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// 43 base64url characters decode to 32 raw bytes (256 bits), which base32
/// encodes (unpadded) as exactly 52 characters. Both lengths are invariants
/// checked by the classifier before this module is consulted.
pub const SANDBOX_LEN: usize = 52;
pub const TXID_LEN: usize = 43;

pub fn encode_base32(bytes: &[u8]) -> String {
  let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
  let mut buffer: u32 = 0;
  let mut bits_in_buffer = 0u32;

  for &byte in bytes {
    buffer = (buffer << 8) | byte as u32;
    bits_in_buffer += 8;
    while bits_in_buffer >= 5 {
      bits_in_buffer -= 5;
      let index = (buffer >> bits_in_buffer) & 0x1f;
      out.push(BASE32_ALPHABET[index as usize] as char);
    }
  }

  if bits_in_buffer > 0 {
    let index = (buffer << (5 - bits_in_buffer)) & 0x1f;
    out.push(BASE32_ALPHABET[index as usize] as char);
  }

  out
}

pub fn decode_base32(input: &str) -> Option<Vec<u8>> {
  let mut buffer: u32 = 0;
  let mut bits_in_buffer = 0u32;
  let mut out = Vec::with_capacity(input.len() * 5 / 8);

  for c in input.chars() {
    let value = BASE32_ALPHABET.iter().position(|&b| b as char == c)? as u32;
    buffer = (buffer << 5) | value;
    bits_in_buffer += 5;
    if bits_in_buffer >= 8 {
      bits_in_buffer -= 8;
      out.push(((buffer >> bits_in_buffer) & 0xff) as u8);
    }
  }

  Some(out)
}

fn decode_base64url(input: &str) -> Option<Vec<u8>> {
  const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

  let mut buffer: u32 = 0;
  let mut bits_in_buffer = 0u32;
  let mut out = Vec::with_capacity(input.len() * 6 / 8);

  for c in input.chars() {
    let value = ALPHABET.iter().position(|&b| b as char == c)? as u32;
    buffer = (buffer << 6) | value;
    bits_in_buffer += 6;
    if bits_in_buffer >= 8 {
      bits_in_buffer -= 8;
      out.push(((buffer >> bits_in_buffer) & 0xff) as u8);
    }
  }

  Some(out)
}

/// True if `id` looks like a well-formed 43-character base64url txId.
pub fn is_valid_tx_id(id: &str) -> bool {
  id.len() == TXID_LEN
    && id
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// True if `subdomain` is a well-formed 52-character lowercase base32 string.
pub fn is_valid_sandbox(subdomain: &str) -> bool {
  subdomain.len() == SANDBOX_LEN
    && subdomain
      .bytes()
      .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Derive the sandbox subdomain for a txId.
pub fn sandbox_for_tx_id(tx_id: &str) -> Option<String> {
  let raw = decode_base64url(tx_id)?;
  Some(encode_base32(&raw))
}

/// True iff `subdomain` is the correct sandbox for `tx_id`.
pub fn sandbox_matches(subdomain: &str, tx_id: &str) -> bool {
  sandbox_for_tx_id(tx_id)
    .map(|expected| expected == subdomain)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_arbitrary_bytes() {
    let bytes = vec![0u8, 1, 2, 3, 4, 255, 128, 64, 17];
    let encoded = encode_base32(&bytes);
    let decoded = decode_base32(&encoded).unwrap();
    assert_eq!(decoded, bytes);
  }

  #[test]
  fn sandbox_is_52_chars_for_32_byte_txid() {
    let tx_id = "A".repeat(TXID_LEN);
    assert!(is_valid_tx_id(&tx_id));
    let sandbox = sandbox_for_tx_id(&tx_id).unwrap();
    assert_eq!(sandbox.len(), SANDBOX_LEN);
    assert!(is_valid_sandbox(&sandbox));
  }

  #[test]
  fn mismatched_sandbox_is_rejected() {
    let tx_id = "A".repeat(TXID_LEN);
    let other = "B".repeat(TXID_LEN);
    let sandbox = sandbox_for_tx_id(&other).unwrap();
    assert!(!sandbox_matches(&sandbox, &tx_id));
  }

  #[test]
  fn rejects_malformed_tx_ids() {
    assert!(!is_valid_tx_id("too-short"));
    assert!(!is_valid_tx_id(&"!".repeat(TXID_LEN)));
  }
}
