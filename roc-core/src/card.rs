use std::sync::Arc;

use crate::bar::Bar;
use crate::buffer::MemoryRegion;
use crate::error::{Error, Result};
use crate::types::{CardFamily, CardId, FirmwareInfo, PciAddress};

/// Static facts about one card, as returned by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDescriptor {
    pub family: CardFamily,
    pub serial: u32,
    pub pci_address: PciAddress,
    pub numa_node: Option<u32>,
    /// Position in the enumeration order, used to resolve `#N` identifiers.
    pub sequence: usize,
}

/// External collaborator that talks to the actual PCI/DMA subsystem.
///
/// `roc-core` never touches `/sys`, `/dev/mem`, or an IOMMU ioctl directly;
/// it is parameterised over this trait so the channel state machine and
/// engines can be exercised without hardware. A real implementation backed
/// by sysfs + the platform's DMA registration API is an external
/// collaborator and is out of scope for this crate.
pub trait CardBackend: Send + Sync {
    /// Enumerate every card on the system whose vendor/device IDs match the
    /// known list.
    fn enumerate(&self) -> Vec<CardDescriptor>;

    /// Bind one of the card's BAR windows for register access.
    fn open_bar(&self, card: &CardDescriptor, bar_index: u32) -> Result<Box<dyn Bar>>;

    /// Register a host memory region with the kernel DMA layer, returning
    /// its scatter-gather list. `buffer_id` must be unique per channel;
    /// re-registering the same ID while an old registration is stale is
    /// handled by the caller's retry-once policy, not here.
    fn register_dma_buffer(
        &self,
        card: &CardDescriptor,
        region: &MemoryRegion,
        buffer_id: u32,
    ) -> Result<crate::buffer::Sgl>;

    /// Unregister a previously-registered DMA buffer.
    fn unregister_dma_buffer(&self, card: &CardDescriptor, buffer_id: u32) -> Result<()>;

    /// Read the card's temperature sensor, if the family/firmware exposes
    /// one. Families without a sensor (model A) return `Ok(None)`.
    fn read_temperature_raw(&self, card: &CardDescriptor) -> Result<Option<u32>> {
        let _ = card;
        Ok(None)
    }

    /// Read the firmware compile-info register, if present.
    fn read_firmware_compile_info_raw(&self, card: &CardDescriptor) -> Result<Option<u32>> {
        let _ = card;
        Ok(None)
    }
}

/// A resolved, live handle to one card. Cheap to clone (shares the backend
/// and is otherwise just the descriptor).
#[derive(Clone)]
pub struct CardHandle {
    backend: Arc<dyn CardBackend>,
    descriptor: CardDescriptor,
}

impl CardHandle {
    pub fn find(backend: Arc<dyn CardBackend>, id: CardId) -> Result<Self> {
        let cards = backend.enumerate();
        let descriptor = match id {
            CardId::Serial(serial) => cards.into_iter().find(|c| c.serial == serial),
            CardId::Pci(addr) => cards.into_iter().find(|c| c.pci_address == addr),
            CardId::Sequence(n) => cards.into_iter().find(|c| c.sequence == n),
        }
        .ok_or(Error::CardNotFound { id })?;
        Ok(Self { backend, descriptor })
    }

    pub fn descriptor(&self) -> &CardDescriptor {
        &self.descriptor
    }

    pub fn family(&self) -> CardFamily {
        self.descriptor.family
    }

    pub fn serial(&self) -> u32 {
        self.descriptor.serial
    }

    pub fn pci_address(&self) -> PciAddress {
        self.descriptor.pci_address
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.descriptor.numa_node
    }

    pub fn open_bar(&self, bar_index: u32) -> Result<Box<dyn Bar>> {
        self.backend.open_bar(&self.descriptor, bar_index)
    }

    pub fn register_dma_buffer(
        &self,
        region: &MemoryRegion,
        buffer_id: u32,
    ) -> Result<crate::buffer::Sgl> {
        self.backend
            .register_dma_buffer(&self.descriptor, region, buffer_id)
    }

    pub fn unregister_dma_buffer(&self, buffer_id: u32) -> Result<()> {
        self.backend
            .unregister_dma_buffer(&self.descriptor, buffer_id)
    }

    /// °C, per the model-B conversion formula below; `Unavailable` for
    /// raw values of 0 or > 1023, or families without a sensor.
    pub fn temperature(&self) -> Result<f64> {
        let raw = self
            .backend
            .read_temperature_raw(&self.descriptor)?
            .ok_or(Error::Unavailable)?;
        convert_temperature(raw).ok_or(Error::Unavailable)
    }

    pub fn firmware_info(&self) -> Result<FirmwareInfo> {
        let raw = self
            .backend
            .read_firmware_compile_info_raw(&self.descriptor)?
            .ok_or(Error::Unavailable)?;
        decode_firmware_info(raw)
    }
}

/// `((693 * raw) / 1024) - 265`, per model B's 10-bit temperature register.
/// `raw == 0` or `raw > 1023` are invalid readings.
pub fn convert_temperature(raw: u32) -> Option<f64> {
    if raw == 0 || raw > 1023 {
        return None;
    }
    Some((693.0 * raw as f64) / 1024.0 - 265.0)
}

/// Decodes `reserved(31:24)=0x02, major(23:20), minor(19:13), year(12:9)+2000,
/// month(8:5), day(4:0)`. Any other reserved byte is a magic mismatch.
pub fn decode_firmware_info(raw: u32) -> Result<FirmwareInfo> {
    let reserved = (raw >> 24) & 0xff;
    if reserved != 0x02 {
        return Err(Error::FirmwareMagicMismatch { raw });
    }
    let major = ((raw >> 20) & 0xf) as u8;
    let minor = ((raw >> 13) & 0x7f) as u8;
    let year = (((raw >> 9) & 0xf) + 2000) as u16;
    let month = ((raw >> 5) & 0xf) as u8;
    let day = (raw & 0x1f) as u8;
    Ok(FirmwareInfo {
        major,
        minor,
        year,
        month,
        day,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_formula_rejects_out_of_range_raw_values() {
        assert_eq!(convert_temperature(0), None);
        assert_eq!(convert_temperature(1024), None);
        let mid = convert_temperature(512).unwrap();
        assert!((mid - 81.28).abs() < 0.01, "got {mid}");
    }

    #[test]
    fn firmware_magic_mismatch_on_bad_reserved_bits() {
        let raw = 0x01_1_2_3_45u32 << 0; // reserved byte 0x01, not 0x02
        let raw = (0x01u32 << 24) | (raw & 0x00ff_ffff);
        let err = decode_firmware_info(raw).unwrap_err();
        assert!(matches!(err, Error::FirmwareMagicMismatch { .. }));
    }

    #[test]
    fn firmware_info_decodes_expected_fields() {
        // reserved=0x02, major=1, minor=2, year offset=3 (-> 2003), month=4, day=5
        let raw = (0x02u32 << 24) | (1 << 20) | (2 << 13) | (3 << 9) | (4 << 5) | 5;
        let info = decode_firmware_info(raw).unwrap();
        assert_eq!(info.major, 1);
        assert_eq!(info.minor, 2);
        assert_eq!(info.year, 2003);
        assert_eq!(info.month, 4);
        assert_eq!(info.day, 5);
    }
}
