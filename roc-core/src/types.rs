use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The two supported hardware families. Selects the engine variant and the
/// channel-number allow-list at channel construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardFamily {
    A,
    B,
}

impl CardFamily {
    /// Channel numbers a card of this family will accept.
    pub fn allowed_channels(self) -> &'static [u32] {
        match self {
            CardFamily::A => &[0, 1, 2, 3, 4, 5],
            CardFamily::B => &[0],
        }
    }

    pub fn is_channel_allowed(self, channel: u32) -> bool {
        self.allowed_channels().contains(&channel)
    }
}

/// `bus:slot.function`, hex, as printed by `lspci`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(bus: u8, slot: u8, function: u8) -> Result<Self, Error> {
        if slot > 0x1f {
            return Err(Error::BadParameter {
                key: "pci-address".into(),
                reason: format!("slot {slot:#x} out of range 0..=0x1f"),
            });
        }
        if function > 7 {
            return Err(Error::BadParameter {
                key: "pci-address".into(),
                reason: format!("function {function:#x} out of range 0..=7"),
            });
        }
        Ok(Self { bus, slot, function })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.slot, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = |reason: String| Error::BadParameter {
            key: "pci-address".into(),
            reason,
        };
        let (bus_str, rest) = s
            .split_once(':')
            .ok_or_else(|| bad(format!("missing ':' in PCI address `{s}`")))?;
        let (slot_str, function_str) = rest
            .split_once('.')
            .ok_or_else(|| bad(format!("missing '.' in PCI address `{s}`")))?;
        let bus = u8::from_str_radix(bus_str, 16).map_err(|e| bad(e.to_string()))?;
        let slot = u8::from_str_radix(slot_str, 16).map_err(|e| bad(e.to_string()))?;
        let function = u8::from_str_radix(function_str, 16).map_err(|e| bad(e.to_string()))?;
        PciAddress::new(bus, slot, function)
    }
}

/// Heterogeneous card identifier, as accepted by `card-id` channel
/// parameters and `CardHandle::find`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardId {
    Serial(u32),
    Pci(PciAddress),
    Sequence(usize),
}

impl FromStr for CardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(rest) = s.strip_prefix('#') {
            let n: usize = rest.parse().map_err(|_| Error::BadParameter {
                key: "card-id".into(),
                reason: format!("`{s}` is not a valid sequence ordinal (expected `#N`)"),
            })?;
            return Ok(CardId::Sequence(n));
        }
        if let Ok(pci) = s.parse::<PciAddress>() {
            return Ok(CardId::Pci(pci));
        }
        if let Ok(serial) = s.parse::<u32>() {
            return Ok(CardId::Serial(serial));
        }
        Err(Error::BadParameter {
            key: "card-id".into(),
            reason: format!("`{s}` is neither a serial, a PCI address, nor `#N`"),
        })
    }
}

/// DMA engine run state. `reset_channel` is only legal in `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    Stopped,
    Started,
}

/// Reset orchestration depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    Nothing,
    Internal,
    InternalDiuSiu,
}

/// Where the card pulls its payload from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    External,
    Internal,
}

/// Loopback routing for the internal pattern generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackMode {
    None,
    Internal,
    Diu,
    Siu,
}

/// Pattern the internal data generator emits when `DataSource::Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorPattern {
    Incremental,
    Alternating,
    Constant,
    Random,
}

/// Readout datapath mode (model B only; ignored by model A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutMode {
    Continuous,
    Packet,
}

/// Client-facing unit returned by `pop_superpage`/`get_superpage`.
///
/// `offset`/`size` describe the reserved byte range within the channel's
/// buffer; `received` tracks engine progress; `ready` is set once the
/// engine considers the superpage complete (successfully or with an
/// arrival error — see `Error::ArrivalError`'s side-channel contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superpage {
    pub offset: usize,
    pub size: usize,
    pub received: usize,
    pub ready: bool,
}

impl Superpage {
    pub fn new(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            received: 0,
            ready: false,
        }
    }
}

/// Firmware fingerprint decoded from `FIRMWARE_COMPILE_INFO` (model B) or
/// the family-specific equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} ({:04}-{:02}-{:02})",
            self.major, self.minor, self.year, self.month, self.day
        )
    }
}
