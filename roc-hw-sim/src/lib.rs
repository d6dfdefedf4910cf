//! A simulated [`roc_core::CardBackend`] that plays the part of the PCIe
//! card well enough to exercise channel open/close, locking, buffer
//! registration, and both engines' push/arrival state machines without
//! real hardware or root privileges.
//!
//! Registers live in a plain atomic array shared between every [`SimBar`]
//! handed out for a card and a background thread (the "pump") that mimics
//! the device: once it sees the driver has started DMA, it periodically
//! writes arrival data into the registered ReadyFIFO / descriptor-status
//! memory, the same way the real card would via its own DMA engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use roc_core::buffer::{Sgl, SglEntry, MIN_SGL_ENTRY_BYTES};
use roc_core::card::{CardBackend, CardDescriptor};
use roc_core::error::{Error, Result};
use roc_core::registers::{a as reg_a, b as reg_b};
use roc_core::{CardFamily, PciAddress};

const REGISTER_COUNT: usize = 4096;
const PUMP_PERIOD: Duration = Duration::from_millis(2);
/// Fixed page length the pump reports for every arrived page. Real
/// hardware reports the page's actual DMA length; the simulation doesn't
/// track per-push page sizes, so it always advertises this many words.
const SIM_PAGE_WORDS: i32 = (8192 / 4) as i32;

struct SimBuffer {
    address: usize,
    size: usize,
}

struct SimCardState {
    descriptor: CardDescriptor,
    registers: Arc<[AtomicU32; REGISTER_COUNT]>,
    buffers: Mutex<HashMap<u32, SimBuffer>>,
    temperature_raw: AtomicU32,
    firmware_raw: AtomicU32,
    stop: AtomicBool,
    /// Set by `SimCard::inject_arrival_error` to make the pump write one
    /// hardware-error status word instead of a normal arrival on its next
    /// write, then clear itself. Used to exercise `Error::ArrivalError`
    /// without a real card.
    inject_error: AtomicBool,
}

/// One simulated card plus its background pump thread. Dropping this stops
/// the pump.
pub struct SimCard {
    state: Arc<SimCardState>,
    pump: Option<JoinHandle<()>>,
}

impl SimCard {
    pub fn new(family: CardFamily, serial: u32, pci_address: PciAddress) -> Self {
        let registers: Arc<[AtomicU32; REGISTER_COUNT]> =
            Arc::new(std::array::from_fn(|_| AtomicU32::new(0)));
        let firmware_raw = match family {
            CardFamily::A => 0,
            CardFamily::B => (0x02 << 24) | (1 << 20) | (3 << 13) | (5 << 9) | (6 << 5) | 1,
        };
        let state = Arc::new(SimCardState {
            descriptor: CardDescriptor {
                family,
                serial,
                pci_address,
                numa_node: Some(0),
                sequence: 0,
            },
            registers,
            buffers: Mutex::new(HashMap::new()),
            temperature_raw: AtomicU32::new(512),
            firmware_raw: AtomicU32::new(firmware_raw),
            stop: AtomicBool::new(false),
            inject_error: AtomicBool::new(false),
        });

        let pump_state = Arc::clone(&state);
        let pump = std::thread::spawn(move || run_pump(pump_state));

        Self {
            state,
            pump: Some(pump),
        }
    }

    pub fn set_temperature_raw(&self, raw: u32) {
        self.state.temperature_raw.store(raw, Ordering::SeqCst);
    }

    pub fn set_firmware_raw(&self, raw: u32) {
        self.state.firmware_raw.store(raw, Ordering::SeqCst);
    }

    /// Makes the pump's next page arrival (model A only) carry a hardware
    /// error status word (`0x8000_0082`) instead of a normal whole-page
    /// arrival, then resume normal operation.
    pub fn inject_arrival_error(&self) {
        self.state.inject_error.store(true, Ordering::SeqCst);
    }
}

impl Drop for SimCard {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

struct SimBar {
    registers: Arc<[AtomicU32; REGISTER_COUNT]>,
}

impl roc_core::bar::Bar for SimBar {
    fn len(&self) -> usize {
        self.registers.len()
    }

    fn read32(&self, index: usize) -> u32 {
        self.registers[index].load(Ordering::SeqCst)
    }

    fn write32(&self, index: usize, value: u32) {
        self.registers[index].store(value, Ordering::SeqCst);
    }
}

/// A [`CardBackend`] that exposes exactly one simulated card. Construct one
/// per test; each owns its own register file and pump thread.
pub struct SimBackend {
    card: SimCard,
}

impl SimBackend {
    pub fn new(family: CardFamily) -> Self {
        let (serial, pci) = match family {
            CardFamily::A => (1000, PciAddress::new(1, 0, 0).unwrap()),
            CardFamily::B => (2000, PciAddress::new(2, 0, 0).unwrap()),
        };
        Self {
            card: SimCard::new(family, serial, pci),
        }
    }

    pub fn card(&self) -> &SimCard {
        &self.card
    }
}

impl CardBackend for SimBackend {
    fn enumerate(&self) -> Vec<CardDescriptor> {
        vec![self.card.state.descriptor.clone()]
    }

    fn open_bar(&self, card: &CardDescriptor, _bar_index: u32) -> Result<Box<dyn roc_core::bar::Bar>> {
        if card.serial != self.card.state.descriptor.serial {
            return Err(Error::CardNotFound {
                id: roc_core::CardId::Serial(card.serial),
            });
        }
        Ok(Box::new(SimBar {
            registers: Arc::clone(&self.card.state.registers),
        }))
    }

    fn register_dma_buffer(
        &self,
        card: &CardDescriptor,
        region: &roc_core::buffer::MemoryRegion,
        buffer_id: u32,
    ) -> Result<Sgl> {
        if card.serial != self.card.state.descriptor.serial {
            return Err(Error::CardNotFound {
                id: roc_core::CardId::Serial(card.serial),
            });
        }
        if region.size < MIN_SGL_ENTRY_BYTES {
            return Err(Error::DmaRegistrationFailed {
                reason: format!(
                    "region of {} bytes is smaller than the {MIN_SGL_ENTRY_BYTES}-byte hugepage minimum",
                    region.size
                ),
            });
        }
        let mut buffers = self.card.state.buffers.lock().unwrap();
        if buffers.contains_key(&buffer_id) {
            return Err(Error::DmaRegistrationFailed {
                reason: format!("buffer id {buffer_id} is already registered"),
            });
        }
        buffers.insert(
            buffer_id,
            SimBuffer {
                address: region.address,
                size: region.size,
            },
        );
        // No IOMMU in the simulation: bus address == user address, one
        // entry covering the whole region.
        Ok(Sgl(vec![SglEntry {
            user_addr: region.address,
            bus_addr: region.address as u64,
            len: region.size,
        }]))
    }

    fn unregister_dma_buffer(&self, card: &CardDescriptor, buffer_id: u32) -> Result<()> {
        if card.serial != self.card.state.descriptor.serial {
            return Err(Error::CardNotFound {
                id: roc_core::CardId::Serial(card.serial),
            });
        }
        self.card.state.buffers.lock().unwrap().remove(&buffer_id);
        Ok(())
    }

    fn read_temperature_raw(&self, card: &CardDescriptor) -> Result<Option<u32>> {
        if card.family != CardFamily::B {
            return Ok(None);
        }
        Ok(Some(self.card.state.temperature_raw.load(Ordering::SeqCst)))
    }

    fn read_firmware_compile_info_raw(&self, card: &CardDescriptor) -> Result<Option<u32>> {
        if card.family != CardFamily::B {
            return Ok(None);
        }
        Ok(Some(self.card.state.firmware_raw.load(Ordering::SeqCst)))
    }
}

fn run_pump(state: Arc<SimCardState>) {
    tracing::debug!(serial = state.descriptor.serial, family = ?state.descriptor.family, "sim pump thread started");
    match state.descriptor.family {
        CardFamily::A => run_pump_a(state),
        CardFamily::B => run_pump_b(state),
    }
}

fn run_pump_a(state: Arc<SimCardState>) {
    let mut cursor: usize = 0;
    while !state.stop.load(Ordering::SeqCst) {
        std::thread::sleep(PUMP_PERIOD);
        let low = state.registers[reg_a::READY_FIFO_BUS_LOW].load(Ordering::SeqCst);
        let high = state.registers[reg_a::READY_FIFO_BUS_HIGH].load(Ordering::SeqCst);
        let bus_address = ((high as u64) << 32) | low as u64;
        if bus_address == 0 {
            continue;
        }

        // Identity-mapped in the simulation: the bus address the driver
        // programmed is a real pointer into this process's memory.
        let base = bus_address as usize as *mut u32;
        let slot = cursor % 128;
        let inject_error = state.inject_error.swap(false, Ordering::SeqCst);
        // SAFETY: the ReadyFIFO region was sized for 128 two-word slots by
        // `ChannelBase::open`, and outlives the pump (the pump is stopped
        // and joined before the channel's mapping is dropped).
        unsafe {
            if inject_error {
                base.add(slot * 2).write_volatile(SIM_PAGE_WORDS as u32);
                base.add(slot * 2 + 1).write_volatile(0x8000_0082);
            } else {
                base.add(slot * 2).write_volatile(SIM_PAGE_WORDS as u32);
                base.add(slot * 2 + 1).write_volatile(0x82);
            }
        }
        cursor = cursor.wrapping_add(1);
    }
}

/// STATUS is one register per link, bit k = descriptor slot k available.
/// Once a link has been programmed (its address-low register is nonzero)
/// the pump keeps all 4 slots marked available, mimicking a card that
/// drains pages as fast as the driver can program descriptors for them.
fn run_pump_b(state: Arc<SimCardState>) {
    while !state.stop.load(Ordering::SeqCst) {
        std::thread::sleep(PUMP_PERIOD);
        let emulator_control = state.registers[reg_b::DATA_EMULATOR_CONTROL].load(Ordering::SeqCst);
        if emulator_control & reg_b::EMULATOR_BIT_READY == 0 {
            continue;
        }
        for link in 0u32..32 {
            let descriptor_base = link as usize * 4;
            let addr_low_index = reg_b::ADDRESS_LOW_BYTE / 4 + descriptor_base;
            if addr_low_index >= REGISTER_COUNT {
                break;
            }
            let addr_low = state.registers[addr_low_index].load(Ordering::SeqCst);
            if addr_low == 0 {
                continue;
            }
            let status_index = reg_b::STATUS_BYTE / 4 + link as usize;
            if status_index < REGISTER_COUNT {
                state.registers[status_index].store(0xf, Ordering::SeqCst);
            }
        }
    }
}
