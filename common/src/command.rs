use crate::mux::{MuxState, MuxVariant};

/// Usable bytes of an inbound command; anything longer resolves to `Disabled`.
pub const MAX_COMMAND_BYTES: usize = 7;

impl MuxVariant {
    /// Resolves an untrusted command. Unknown, empty or oversized input disables the switch.
    pub fn normalize(self, raw: &str) -> MuxState {
        if raw.len() > MAX_COMMAND_BYTES {
            return MuxState::Disabled;
        }

        let state = match raw {
            "A" => MuxState::PathAAll,
            "B" => MuxState::PathBAll,
            "OFF" => MuxState::Disabled,
            "A0" if self == Self::Extended => MuxState::PathAInput0Only,
            "B0" if self == Self::Extended => MuxState::PathBInput0Only,
            _ => MuxState::Disabled,
        };

        debug_assert!(self.supports(state));
        state
    }

    pub fn normalize_bytes(self, raw: &[u8]) -> MuxState {
        match core::str::from_utf8(raw) {
            Ok(text) => self.normalize(text),
            Err(_) => MuxState::Disabled,
        }
    }
}

/// Bounded, printable copy of a raw command for status and logs.
pub fn command_preview(raw: &[u8]) -> String {
    let end = raw.len().min(MAX_COMMAND_BYTES);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn accepts_exact_tokens() {
        assert_eq!(MuxVariant::Basic.normalize("A"), MuxState::PathAAll);
        assert_eq!(MuxVariant::Basic.normalize("B"), MuxState::PathBAll);
        assert_eq!(MuxVariant::Basic.normalize("OFF"), MuxState::Disabled);
        assert_eq!(MuxVariant::Extended.normalize("A0"), MuxState::PathAInput0Only);
        assert_eq!(MuxVariant::Extended.normalize("B0"), MuxState::PathBInput0Only);
        assert_eq!(MuxVariant::Extended.normalize("B"), MuxState::PathBAll);
    }

    #[test]
    fn unknown_input_fails_safe() {
        for raw in ["", "a", "b", "off", " A", "A ", "A\n", "garbage", "AB", "C", "0"] {
            assert_eq!(MuxVariant::Basic.normalize(raw), MuxState::Disabled, "{raw:?}");
            assert_eq!(MuxVariant::Extended.normalize(raw), MuxState::Disabled, "{raw:?}");
        }
    }

    #[test]
    fn basic_variant_rejects_extended_tokens() {
        assert_eq!(MuxVariant::Basic.normalize("A0"), MuxState::Disabled);
        assert_eq!(MuxVariant::Basic.normalize("B0"), MuxState::Disabled);
    }

    #[test]
    fn oversized_input_fails_safe() {
        let long = "A".repeat(4096);
        assert_eq!(MuxVariant::Basic.normalize(&long), MuxState::Disabled);
        assert_eq!(MuxVariant::Basic.normalize("AAAAAAAA"), MuxState::Disabled);
        // Eight bytes whose first seven would otherwise be a plausible prefix.
        assert_eq!(MuxVariant::Basic.normalize("A      x"), MuxState::Disabled);
    }

    #[test]
    fn invalid_utf8_fails_safe() {
        assert_eq!(MuxVariant::Basic.normalize_bytes(&[0xff]), MuxState::Disabled);
        assert_eq!(MuxVariant::Basic.normalize_bytes(&[b'A', 0xc3]), MuxState::Disabled);
        assert_eq!(MuxVariant::Basic.normalize_bytes(b"A"), MuxState::PathAAll);
    }

    #[test]
    fn normalize_then_map_is_idempotent() {
        for raw in ["A", "B", "garbage", ""] {
            let first = MuxVariant::Basic.normalize(raw).lines();
            let second = MuxVariant::Basic.normalize(raw).lines();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn preview_is_bounded_and_lossy() {
        assert_eq!(command_preview(b"garbage-and-more"), "garbage");
        assert_eq!(command_preview(&[b'A', 0xff]), "A\u{fffd}");
    }
}
