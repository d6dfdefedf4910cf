use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::{BufferProvider, FileMapping, MemoryRegion};
use crate::card::CardBackend;
use crate::card::CardHandle;
use crate::config::{EngineConfig, DEFAULT_PAGE_SIZE};
use crate::engine::Engine;
use crate::engine_a::EngineA;
use crate::engine_b::EngineB;
use crate::error::{Error, Result};
use crate::lock::ChannelLock;
use crate::types::{
    CardFamily, CardId, DataSource, FirmwareInfo, GeneratorPattern, LoopbackMode, PciAddress,
    ReadoutMode, ResetLevel, Superpage,
};

/// Where the channel's DMA target buffer comes from.
#[derive(Debug, Clone)]
pub enum BufferParameters {
    /// No DMA target; useful for register-only access or tests that never
    /// push superpages.
    Null,
    /// A buffer the caller already owns and has mapped at `address`.
    Memory { address: usize, size: usize },
    /// A huge-page-backed file the channel creates (if missing) and maps
    /// itself.
    File { path: PathBuf, size: usize },
}

/// Everything needed to open one channel, parsed from a flat string map
/// (the shape config files and CLI flags both reduce to).
#[derive(Debug, Clone)]
pub struct ChannelParameters {
    pub card_id: CardId,
    pub channel: u32,
    pub dma_page_size: u32,
    pub generator_enabled: bool,
    pub generator_pattern: GeneratorPattern,
    pub generator_data_size: u32,
    pub loopback_mode: LoopbackMode,
    pub data_source: DataSource,
    pub initial_reset_level: ResetLevel,
    pub readout_mode: ReadoutMode,
    pub rdyrx_suppressed: bool,
    pub force_unlock: bool,
    pub buffer: BufferParameters,
}

fn get<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(|s| s.as_str())
}

fn parse_bool(map: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match get(map, key) {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(Error::BadParameter {
            key: key.into(),
            reason: format!("`{other}` is not a recognized boolean"),
        }),
    }
}

fn parse_u32(map: &HashMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match get(map, key) {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| Error::BadParameter {
            key: key.into(),
            reason: format!("`{s}` is not a valid integer"),
        }),
    }
}

fn parse_enum<T: Copy>(
    map: &HashMap<String, String>,
    key: &str,
    default: T,
    variants: &[(&str, T)],
) -> Result<T> {
    match get(map, key) {
        None => Ok(default),
        Some(s) => variants
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::BadParameter {
                key: key.into(),
                reason: format!(
                    "`{s}` is not one of: {}",
                    variants.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
                ),
            }),
    }
}

impl ChannelParameters {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let card_id_str = get(map, "card-id").ok_or_else(|| Error::BadParameter {
            key: "card-id".into(),
            reason: "required parameter is missing".into(),
        })?;
        let card_id: CardId = card_id_str.parse()?;

        let channel = parse_u32(map, "channel", 0)?;

        let buffer = match get(map, "buffer-type").unwrap_or("null") {
            "null" => BufferParameters::Null,
            "memory" => {
                let address = get(map, "buffer-address")
                    .ok_or_else(|| Error::BadParameter {
                        key: "buffer-address".into(),
                        reason: "required when buffer-type=memory".into(),
                    })?
                    .parse::<usize>()
                    .map_err(|_| Error::BadParameter {
                        key: "buffer-address".into(),
                        reason: "not a valid integer".into(),
                    })?;
                let size = get(map, "buffer-size")
                    .ok_or_else(|| Error::BadParameter {
                        key: "buffer-size".into(),
                        reason: "required when buffer-type=memory".into(),
                    })?
                    .parse::<usize>()
                    .map_err(|_| Error::BadParameter {
                        key: "buffer-size".into(),
                        reason: "not a valid integer".into(),
                    })?;
                BufferParameters::Memory { address, size }
            }
            "file" => {
                let path = get(map, "buffer-path")
                    .ok_or_else(|| Error::BadParameter {
                        key: "buffer-path".into(),
                        reason: "required when buffer-type=file".into(),
                    })?
                    .into();
                let size = get(map, "buffer-size")
                    .ok_or_else(|| Error::BadParameter {
                        key: "buffer-size".into(),
                        reason: "required when buffer-type=file".into(),
                    })?
                    .parse::<usize>()
                    .map_err(|_| Error::BadParameter {
                        key: "buffer-size".into(),
                        reason: "not a valid integer".into(),
                    })?;
                BufferParameters::File { path, size }
            }
            other => {
                return Err(Error::BadParameter {
                    key: "buffer-type".into(),
                    reason: format!("`{other}` must be one of: null, memory, file"),
                })
            }
        };

        Ok(Self {
            card_id,
            channel,
            dma_page_size: parse_u32(map, "dma-page-size", DEFAULT_PAGE_SIZE)?,
            generator_enabled: parse_bool(map, "generator-enabled", false)?,
            generator_pattern: parse_enum(
                map,
                "generator-pattern",
                GeneratorPattern::Incremental,
                &[
                    ("incremental", GeneratorPattern::Incremental),
                    ("alternating", GeneratorPattern::Alternating),
                    ("constant", GeneratorPattern::Constant),
                    ("random", GeneratorPattern::Random),
                ],
            )?,
            generator_data_size: parse_u32(map, "generator-data-size", DEFAULT_PAGE_SIZE)?,
            loopback_mode: parse_enum(
                map,
                "loopback-mode",
                LoopbackMode::None,
                &[
                    ("none", LoopbackMode::None),
                    ("internal", LoopbackMode::Internal),
                    ("diu", LoopbackMode::Diu),
                    ("siu", LoopbackMode::Siu),
                ],
            )?,
            data_source: parse_enum(
                map,
                "data-source",
                DataSource::External,
                &[
                    ("external", DataSource::External),
                    ("internal", DataSource::Internal),
                ],
            )?,
            initial_reset_level: parse_enum(
                map,
                "initial-reset-level",
                ResetLevel::Internal,
                &[
                    ("nothing", ResetLevel::Nothing),
                    ("internal", ResetLevel::Internal),
                    ("internal-diu-siu", ResetLevel::InternalDiuSiu),
                ],
            )?,
            readout_mode: parse_enum(
                map,
                "readout-mode",
                ReadoutMode::Continuous,
                &[
                    ("continuous", ReadoutMode::Continuous),
                    ("packet", ReadoutMode::Packet),
                ],
            )?,
            rdyrx_suppressed: parse_bool(map, "rdyrx-suppressed", false)?,
            force_unlock: parse_bool(map, "force-unlock", false)?,
            buffer,
        })
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.dma_page_size,
            generator_enabled: self.generator_enabled,
            generator_pattern: self.generator_pattern,
            generator_data_size: self.generator_data_size,
            loopback_mode: self.loopback_mode,
            data_source: self.data_source,
            initial_reset_level: self.initial_reset_level,
            readout_mode: self.readout_mode,
            link_mask: 1 << self.channel.min(31),
            rdyrx_suppressed: self.rdyrx_suppressed,
        }
    }
}

/// Depth of each family's transfer queue, i.e. how many superpages can be
/// in flight (pushed-but-not-popped) at once.
const SP_QUEUE_CAPACITY: usize = 32;

/// Vendor string baked into the shared-state file names below. The card
/// family this crate drives only ever ships under this name.
const VENDOR: &str = "AliceO2";

const SHARED_MEMORY_ROOT: &str = "/dev/shm";

fn channel_base_name(pci: PciAddress, channel: u32) -> String {
    format!("{VENDOR}_RoC_{pci}_Channel_{channel}")
}

/// The channel lock file and named-mutex marker, keyed by PCI address
/// (not serial number: the lock must be unique per physical slot even if
/// two cards somehow shared a serial).
fn shared_state_paths(pci: PciAddress, channel: u32) -> (PathBuf, PathBuf) {
    let base = channel_base_name(pci, channel);
    let lock_path = PathBuf::from(SHARED_MEMORY_ROOT).join(format!("{base}.lock"));
    let mutex_path = PathBuf::from(SHARED_MEMORY_ROOT).join(format!("{base}_Mutex"));
    (lock_path, mutex_path)
}

fn shared_memory_dir(pci: PciAddress, channel: u32) -> PathBuf {
    PathBuf::from(SHARED_MEMORY_ROOT).join(channel_base_name(pci, channel))
}

/// Asserts `dir` is backed by tmpfs or hugetlbfs, per the construction-step
/// rule that the channel's shared-memory files must live on a real shared-
/// memory filesystem rather than disk.
fn assert_shared_memory_filesystem(dir: &std::path::Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    const TMPFS_MAGIC: i64 = 0x0102_1994;
    const HUGETLBFS_MAGIC: i64 = 0x958458f6u32 as i32 as i64;

    let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes()).map_err(|e| Error::LockFailed {
        reason: format!("path {} is not representable as a C string: {e}", dir.display()),
    })?;
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::LockFailed {
            reason: format!("statfs({}) failed: {}", dir.display(), std::io::Error::last_os_error()),
        });
    }
    let magic = stat.f_type as i64;
    if magic != TMPFS_MAGIC && magic != HUGETLBFS_MAGIC {
        return Err(Error::LockFailed {
            reason: format!(
                "{} is not backed by tmpfs or hugetlbfs (f_type=0x{magic:x})",
                dir.display()
            ),
        });
    }
    Ok(())
}

/// One open DMA channel: the top-level object clients construct, drive,
/// and close. Owns the channel lock for as long as it's alive; dropping it
/// releases the lock and unregisters any buffers it registered.
pub struct ChannelBase {
    card: CardHandle,
    channel: u32,
    params: ChannelParameters,
    _lock: ChannelLock,
    buffer: BufferProvider,
    // Declared (and thus dropped) before `_ready_fifo`: `engine` may hold a
    // `MemoryBar` pointing into the ReadyFIFO mapping, and Rust drops
    // struct fields in declaration order, so the engine must go first.
    engine: Engine,
    _ready_fifo: Option<FileMapping>,
}

impl std::fmt::Debug for ChannelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBase")
            .field("channel", &self.channel)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ChannelBase {
    pub fn open(backend: Arc<dyn CardBackend>, params: ChannelParameters) -> Result<Self> {
        let card = CardHandle::find(backend, params.card_id)?;

        if !card.family().is_channel_allowed(params.channel) {
            return Err(Error::InvalidChannel {
                channel: params.channel,
            });
        }

        let pci = card.pci_address();
        let (lock_path, mutex_path) = shared_state_paths(pci, params.channel);
        let dir = shared_memory_dir(pci, params.channel);
        std::fs::create_dir_all(&dir).map_err(|e| Error::LockFailed {
            reason: format!("could not create {}: {e}", dir.display()),
        })?;
        assert_shared_memory_filesystem(&dir)?;

        let lock = ChannelLock::acquire(&lock_path, &mutex_path, params.force_unlock)?;

        let buffer = Self::make_buffer(&card, &params, &dir)?;

        let mut ready_fifo_mapping = None;
        let control_bar = card.open_bar(0)?;

        let engine = match card.family() {
            CardFamily::A => {
                let ready_fifo_path = dir.join("ready-fifo");
                let mapping = FileMapping::create(&ready_fifo_path, crate::buffer::MIN_SGL_ENTRY_BYTES)?;
                let region = MemoryRegion {
                    address: mapping.address(),
                    size: mapping.size(),
                };
                let ready_fifo_id = params.channel * 2 + 1;
                let ready_sgl = Self::register_with_retry(&card, &region, ready_fifo_id)?;
                let bus_addr = ready_sgl.0.first().ok_or(Error::BufferTooSmall {
                    got: 0,
                    need: crate::buffer::MIN_SGL_ENTRY_BYTES,
                })?.bus_addr;
                // SAFETY: `mapping` stays alive for at least as long as the
                // engine does; `ChannelBase` drops its engine before its
                // `_ready_fifo` mapping (declaration order).
                let ready_fifo_bar = Box::new(unsafe {
                    crate::bar::MemoryBar::new(mapping.address(), mapping.size() / 4)
                });
                ready_fifo_mapping = Some(mapping);
                Engine::A(Box::new(EngineA::new(
                    control_bar,
                    ready_fifo_bar,
                    bus_addr,
                    params.engine_config(),
                    SP_QUEUE_CAPACITY,
                )))
            }
            CardFamily::B => Engine::B {
                engine: Box::new(EngineB::new(control_bar, params.engine_config(), SP_QUEUE_CAPACITY)),
                link: params.channel,
            },
        };

        Ok(Self {
            card,
            channel: params.channel,
            params,
            _lock: lock,
            buffer,
            _ready_fifo: ready_fifo_mapping,
            engine,
        })
    }

    fn make_buffer(card: &CardHandle, params: &ChannelParameters, dir: &std::path::Path) -> Result<BufferProvider> {
        let buffer_id = params.channel * 2;
        match &params.buffer {
            BufferParameters::Null => Ok(BufferProvider::null()),
            BufferParameters::Memory { address, size } => {
                let region = MemoryRegion {
                    address: *address,
                    size: *size,
                };
                let sgl = Self::register_with_retry(card, &region, buffer_id)?;
                Ok(BufferProvider::memory(region, sgl))
            }
            BufferParameters::File { path, size } => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    dir.join(path)
                };
                let mapping = FileMapping::create(&path, *size)?;
                let region = MemoryRegion {
                    address: mapping.address(),
                    size: mapping.size(),
                };
                let sgl = Self::register_with_retry(card, &region, buffer_id)?;
                Ok(BufferProvider::file(mapping, sgl))
            }
        }
    }

    /// Registers a DMA buffer, retrying once if the ID collides with a
    /// stale registration left behind by a crashed process: unregister
    /// whatever is there and try again.
    fn register_with_retry(
        card: &CardHandle,
        region: &MemoryRegion,
        buffer_id: u32,
    ) -> Result<crate::buffer::Sgl> {
        match card.register_dma_buffer(region, buffer_id) {
            Ok(sgl) => Ok(sgl),
            Err(_) => {
                card.unregister_dma_buffer(buffer_id).ok();
                card.register_dma_buffer(region, buffer_id)
            }
        }
    }

    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    pub fn start_dma(&mut self) -> Result<()> {
        self.engine.start_dma()
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        self.engine.stop_dma()
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        self.engine.reset_channel(level)
    }

    pub fn push_superpage(&mut self, offset: usize, size: usize) -> Result<()> {
        let bus_address = self.buffer.bus_offset(offset)?;
        self.engine.push_superpage(offset, size, self.buffer.size(), bus_address)
    }

    pub fn fill_superpages(&mut self) -> Result<()> {
        self.engine.fill_superpages()
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        self.engine.get_superpage()
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        self.engine.pop_superpage()
    }

    pub fn transfer_queue_available(&self) -> Result<usize> {
        self.engine.transfer_queue_available()
    }

    pub fn ready_queue_size(&self) -> Result<usize> {
        self.engine.ready_queue_size()
    }

    pub fn card_type(&self) -> CardFamily {
        self.card.family()
    }

    pub fn pci_address(&self) -> PciAddress {
        self.card.pci_address()
    }

    pub fn serial(&self) -> u32 {
        self.card.serial()
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.card.numa_node()
    }

    pub fn channel_number(&self) -> u32 {
        self.channel
    }

    pub fn firmware_info(&self) -> Result<FirmwareInfo> {
        self.card.firmware_info()
    }

    pub fn temperature(&self) -> Result<f64> {
        self.card.temperature()
    }
}

impl Drop for ChannelBase {
    fn drop(&mut self) {
        if self.engine.dma_state() == crate::types::DmaState::Started {
            if let Err(e) = self.engine.stop_dma() {
                tracing::warn!(error = %e, "failed to stop DMA while closing channel");
            }
        }
        if !matches!(self.params.buffer, BufferParameters::Null) {
            let buffer_id = self.channel * 2;
            if let Err(e) = self.card.unregister_dma_buffer(buffer_id) {
                tracing::warn!(error = %e, "failed to unregister DMA buffer while closing channel");
            }
        }
        if matches!(self.card.family(), CardFamily::A) {
            let ready_fifo_id = self.channel * 2 + 1;
            if let Err(e) = self.card.unregister_dma_buffer(ready_fifo_id) {
                tracing::warn!(error = %e, "failed to unregister ready fifo buffer while closing channel");
            }
        }
    }
}
