//! Signing kinds and the monotonic high-watermark rule.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Consensus operation kind, identified by the payload's leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignKind {
    /// Block proposal (0x11).
    Block = 0x11,
    /// Preattestation (0x12).
    Preattestation = 0x12,
    /// Attestation (0x13).
    Attestation = 0x13,
}

impl SignKind {
    /// Every kind, in tag order.
    pub const ALL: [SignKind; 3] = [
        SignKind::Block,
        SignKind::Preattestation,
        SignKind::Attestation,
    ];

    /// Parse a payload tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x11 => Some(SignKind::Block),
            0x12 => Some(SignKind::Preattestation),
            0x13 => Some(SignKind::Attestation),
            _ => None,
        }
    }

    /// The payload tag byte.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Human-readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            SignKind::Block => "block",
            SignKind::Preattestation => "preattestation",
            SignKind::Attestation => "attestation",
        }
    }
}

impl fmt::Display for SignKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The highest (level, round) signed for one kind.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Watermark {
    pub level: u64,
    pub round: u32,
}

impl Watermark {
    /// Create a watermark.
    pub fn new(level: u64, round: u32) -> Self {
        Self { level, round }
    }

    /// Lexicographic monotonicity: true when `self` strictly exceeds
    /// `prev`, i.e. signing at `self` after `prev` is safe.
    pub fn supersedes(&self, prev: &Watermark) -> bool {
        self.level > prev.level || (self.level == prev.level && self.round > prev.round)
    }
}

/// Per-key watermark state, persisted encrypted under the key's DEK.
///
/// Keyed by the kind tag byte so the serialized form is stable and
/// self-describing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub by_kind: BTreeMap<u8, Watermark>,
}

impl KeyState {
    /// State with all kinds zeroed.
    pub fn zeroed() -> Self {
        let mut state = Self::default();
        for kind in SignKind::ALL {
            state.by_kind.insert(kind.tag(), Watermark::default());
        }
        state
    }

    /// The watermark for `kind` (zero if absent).
    pub fn watermark(&self, kind: SignKind) -> Watermark {
        self.by_kind.get(&kind.tag()).copied().unwrap_or_default()
    }

    /// Set the watermark for `kind`.
    pub fn set(&mut self, kind: SignKind, watermark: Watermark) {
        self.by_kind.insert(kind.tag(), watermark);
    }

    /// Merge another state by keeping, per kind, the entry with the larger
    /// level. Used to reconcile the main state file with a residual
    /// crash backup.
    pub fn merge_max_level(&mut self, other: &KeyState) {
        for (tag, theirs) in &other.by_kind {
            match self.by_kind.get(tag) {
                Some(ours) if theirs.level <= ours.level => {}
                _ => {
                    self.by_kind.insert(*tag, *theirs);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersedes_is_lexicographic() {
        let prev = Watermark::new(5, 2);
        assert!(Watermark::new(6, 0).supersedes(&prev));
        assert!(Watermark::new(5, 3).supersedes(&prev));
        assert!(!Watermark::new(5, 2).supersedes(&prev));
        assert!(!Watermark::new(5, 1).supersedes(&prev));
        assert!(!Watermark::new(4, 9).supersedes(&prev));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(SignKind::Block.tag(), 0x11);
        assert_eq!(SignKind::Preattestation.tag(), 0x12);
        assert_eq!(SignKind::Attestation.tag(), 0x13);
        assert_eq!(SignKind::from_tag(0x14), None);
        for kind in SignKind::ALL {
            assert_eq!(SignKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn test_merge_picks_larger_level() {
        let mut main = KeyState::zeroed();
        main.set(SignKind::Block, Watermark::new(10, 0));
        main.set(SignKind::Attestation, Watermark::new(4, 1));

        let mut backup = KeyState::zeroed();
        backup.set(SignKind::Block, Watermark::new(9, 5));
        backup.set(SignKind::Attestation, Watermark::new(5, 0));

        main.merge_max_level(&backup);
        assert_eq!(main.watermark(SignKind::Block), Watermark::new(10, 0));
        assert_eq!(main.watermark(SignKind::Attestation), Watermark::new(5, 0));
    }

    #[test]
    fn test_state_codec_is_stable() {
        let mut state = KeyState::zeroed();
        state.set(SignKind::Block, Watermark::new(1, 2));

        let a = bincode::serialize(&state).unwrap();
        let b = bincode::serialize(&state).unwrap();
        assert_eq!(a, b);

        let decoded: KeyState = bincode::deserialize(&a).unwrap();
        assert_eq!(decoded, state);
    }
}
