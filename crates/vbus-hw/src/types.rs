use core::fmt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const STANDARD_ID_MAX: u32 = 0x7FF;
const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Which physical bus an interface or socket speaks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    Can,
    J1708,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Can => f.write_str("CAN"),
            BusKind::J1708 => f.write_str("J1708"),
        }
    }
}

/// Standard (11-bit) or extended (29-bit) addressing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanFrameType {
    Standard,
    Extended,
}

impl CanFrameType {
    fn id_max(self) -> u32 {
        match self {
            CanFrameType::Standard => STANDARD_ID_MAX,
            CanFrameType::Extended => EXTENDED_ID_MAX,
        }
    }
}

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if u32::from(id11) <= STANDARD_ID_MAX {
            Some(Self {
                raw: u32::from(id11),
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= EXTENDED_ID_MAX {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Build an id of the given addressing type.
    pub fn new(raw: u32, frame_type: CanFrameType) -> Option<Self> {
        match frame_type {
            CanFrameType::Standard => u16::try_from(raw).ok().and_then(Self::standard),
            CanFrameType::Extended => Self::extended(raw),
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn frame_type(&self) -> CanFrameType {
        if self.extended {
            CanFrameType::Extended
        } else {
            CanFrameType::Standard
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN data frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(self.data.len());
        &self.data[..len]
    }

    pub fn frame_type(&self) -> CanFrameType {
        self.id.frame_type()
    }
}

/// Longest J1708 message body accepted (MID and checksum excluded).
pub const J1708_MAX_PAYLOAD: usize = 21;

/// A J1708 message: priority (1 = highest, 8 = lowest), MID and payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct J1708Frame {
    priority: u8,
    mid: u8,
    data: Vec<u8>,
    pub timestamp: Option<Timestamp>,
}

impl J1708Frame {
    pub fn new(priority: u8, mid: u8, data: &[u8]) -> Option<Self> {
        if !(1..=8).contains(&priority) || data.len() > J1708_MAX_PAYLOAD {
            return None;
        }
        Some(Self {
            priority,
            mid,
            data: data.to_vec(),
            timestamp: None,
        })
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn mid(&self) -> u8 {
        self.mid
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

/// Acceptance filter installed on an interface: an incoming id is accepted when
/// `(incoming & mask) == (listed & mask)` for any listed id of the same frame type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HardwareFilter {
    ids: Vec<u32>,
    mask: u32,
    frame_type: CanFrameType,
}

impl HardwareFilter {
    /// Returns `None` when `ids` is empty or an id/mask does not fit the frame type.
    pub fn new(ids: Vec<u32>, mask: u32, frame_type: CanFrameType) -> Option<Self> {
        let max = frame_type.id_max();
        if ids.is_empty() || mask > max || ids.iter().any(|&id| id > max) {
            return None;
        }
        Some(Self {
            ids,
            mask,
            frame_type,
        })
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn frame_type(&self) -> CanFrameType {
        self.frame_type
    }

    pub fn matches(&self, id: CanId) -> bool {
        id.frame_type() == self.frame_type
            && self
                .ids
                .iter()
                .any(|&listed| (id.raw() & self.mask) == (listed & self.mask))
    }
}

impl fmt::Display for HardwareFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for id in &self.ids {
            write!(f, "x{id:X} ")?;
        }
        write!(f, "M:x{:X})", self.mask)
    }
}

/// Render a filter list the way bring-up logs it.
pub fn describe_filters(filters: &[HardwareFilter]) -> String {
    filters
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(OffsetDateTime::now_utc())
    }
}

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}
