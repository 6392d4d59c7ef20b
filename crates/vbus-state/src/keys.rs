use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Stable integer identifier of a persisted flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub u32);

impl StateKey {
    pub const FLAG_CAN_ON: StateKey = StateKey(201);
    /// Superseded by [`StateKey::FLAG_CAN_AUTODETECT`]; still read by older policies.
    pub const FLAG_CAN_LISTENONLY: StateKey = StateKey(202);
    pub const CAN_BITRATE: StateKey = StateKey(203);
    pub const CAN_FILTER_IDS: StateKey = StateKey(204);
    pub const CAN_FILTER_MASKS: StateKey = StateKey(205);
    pub const FLAG_CAN_AUTODETECT: StateKey = StateKey(206);
    /// Bitrate seen carrying valid traffic; lets the next boot skip listen-only probing.
    pub const CAN_CONFIRMED_BITRATE: StateKey = StateKey(207);
    pub const FLAG_J1708_ON: StateKey = StateKey(210);

    pub const KNOWN: [(StateKey, &'static str); 8] = [
        (Self::FLAG_CAN_ON, "can_on"),
        (Self::FLAG_CAN_LISTENONLY, "can_listen_only"),
        (Self::CAN_BITRATE, "can_bitrate"),
        (Self::CAN_FILTER_IDS, "can_filter_ids"),
        (Self::CAN_FILTER_MASKS, "can_filter_masks"),
        (Self::FLAG_CAN_AUTODETECT, "can_autodetect"),
        (Self::CAN_CONFIRMED_BITRATE, "can_confirmed_bitrate"),
        (Self::FLAG_J1708_ON, "j1708_on"),
    ];

    pub fn name(self) -> Option<&'static str> {
        Self::KNOWN
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, n)| *n)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for StateKey {
    type Err = String;

    /// Accepts a numeric id or one of the known flag names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(n) = t.parse::<u32>() {
            return Ok(StateKey(n));
        }
        Self::KNOWN
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(t))
            .map(|(k, _)| *k)
            .ok_or_else(|| format!("unknown state key: {t}"))
    }
}
