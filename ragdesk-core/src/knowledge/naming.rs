//! File-name transport encoding.
//!
//! Some document stores mangle non-ASCII names on upload. Names are encoded before they
//! leave the client and decoded when listings come back, so the user always sees the name
//! they picked.

use serde::{Deserialize, Serialize};

/// Marks a wire name as written by [`NameEncoding::Percent`].
const PERCENT_MARKER: &str = "~u8~";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameEncoding {
    /// Names are sent as-is.
    Identity,
    /// Everything outside `[A-Za-z0-9-_.~]` is percent-encoded as UTF-8, behind a marker
    /// prefix.
    #[default]
    Percent,
}

impl NameEncoding {
    pub fn encode(self, name: &str) -> String {
        match self {
            NameEncoding::Identity => name.to_string(),
            NameEncoding::Percent => format!("{PERCENT_MARKER}{}", urlencoding::encode(name)),
        }
    }

    /// Inverse of [`encode`](Self::encode). Names without the marker, or that do not
    /// decode cleanly, were not produced by this client and are returned unchanged.
    pub fn decode(self, wire: &str) -> String {
        match self {
            NameEncoding::Identity => wire.to_string(),
            NameEncoding::Percent => wire
                .strip_prefix(PERCENT_MARKER)
                .and_then(|encoded| urlencoding::decode(encoded).ok())
                .map(|name| name.into_owned())
                .unwrap_or_else(|| wire.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_japanese_name_is_ascii_on_the_wire() {
        let wire = NameEncoding::Percent.encode("報告書.pdf");
        assert!(wire.is_ascii());
        assert!(wire.ends_with(".pdf"));
        assert_eq!(NameEncoding::Percent.decode(&wire), "報告書.pdf");
    }

    #[test]
    fn test_foreign_names_pass_through() {
        assert_eq!(NameEncoding::Percent.decode("plain.txt"), "plain.txt");
        assert_eq!(NameEncoding::Percent.decode("bad%ZZname"), "bad%ZZname");
    }

    #[test]
    fn test_foreign_names_with_escapes_are_kept_literally() {
        assert_eq!(NameEncoding::Percent.decode("50%25 off.pdf"), "50%25 off.pdf");
        assert_eq!(NameEncoding::Percent.decode("a%20b.txt"), "a%20b.txt");
    }

    #[test]
    fn test_literal_percent_in_user_name_survives() {
        let wire = NameEncoding::Percent.encode("50% off.pdf");
        assert_eq!(wire, "~u8~50%25%20off.pdf");
        assert_eq!(NameEncoding::Percent.decode(&wire), "50% off.pdf");
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_name(name in "\\PC*") {
            for encoding in [NameEncoding::Identity, NameEncoding::Percent] {
                prop_assert_eq!(encoding.decode(&encoding.encode(&name)), name.clone());
            }
        }
    }
}
