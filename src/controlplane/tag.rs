//! Volume name tags
//!
//! The orchestrator names volumes freely, while logical volume ids are
//! generated. The requested name is recorded as a tag on the volume so a
//! repeated CreateVolume can find it again. Names made only of characters
//! LVM accepts in tags are stored verbatim behind `VN.`; anything else is
//! base64url-encoded (no padding) behind `VN+`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Prefix for names stored verbatim
pub const PLAIN_PREFIX: &str = "VN.";
/// Prefix for base64url-encoded names
pub const ENCODED_PREFIX: &str = "VN+";

pub(crate) fn is_tag_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '.' | '-')
}

/// Encode a requested volume name as a tag
pub fn encode(name: &str) -> String {
    if name.chars().all(is_tag_safe) {
        format!("{}{}", PLAIN_PREFIX, name)
    } else {
        format!("{}{}", ENCODED_PREFIX, URL_SAFE_NO_PAD.encode(name.as_bytes()))
    }
}

/// Recover the requested name from a tag, `None` if it is not a name tag
pub fn decode(tag: &str) -> Option<String> {
    if let Some(name) = tag.strip_prefix(PLAIN_PREFIX) {
        return Some(name.to_string());
    }
    let encoded = tag.strip_prefix(ENCODED_PREFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}
