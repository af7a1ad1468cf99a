//! BSE: the security/crypto command-queue engine of the video-decode block.
//!
//! The block exposes a single register window. Firmware drives it by writing
//! 32-bit opcoded command words to `ICMDQUE_WR`; the engine latches DMA
//! addresses, fetches key tables into one of eight key/IV slots, and runs
//! AES CBC/ECB transfers directly against guest physical memory. Two
//! instances exist per SoC — the video engine and its audio companion — and
//! they share the `SECURE_SECURITY` register.
//!
//! Protocol hazard worth knowing before touching the decoder: after a
//! `DMASETUP` command the very next word written to the queue is consumed as
//! the source physical address, *before* opcode dispatch. Firmware relies on
//! this, so the pending-operand check must stay ahead of the opcode match.
//!
//! The engine also carries the documented secure-boot bypass: once command
//! opcode 0x1F arms the sticky FAKE flag, cipher runs emit a fixed canned
//! pattern instead of ciphertext until the flag is disarmed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;
use kestrel_io_snapshot::state::codec::{Decoder, Encoder};
use kestrel_io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use kestrel_mem::{GuestMemory, GuestMemoryError, MmioHandler};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::clock::ClockGate;
use crate::irq::IrqLine;
use crate::vde::cipher::{self, ChainMode, Direction, KeyLength, AES_BLOCK_SIZE};
use crate::vde::sxe::SxeRegs;

pub const BSE_MMIO_SIZE: u64 = 0x200;

pub const REG_ICMDQUE_WR: u64 = 0x000;
pub const REG_CMDQUE_CONTROL: u64 = 0x008;
pub const REG_INTR_STATUS: u64 = 0x018;
pub const REG_BSE_INT_ENB: u64 = 0x040;
pub const REG_BSE_CONFIG: u64 = 0x044;
pub const REG_SECURE_DEST_ADDR: u64 = 0x100;
pub const REG_SECURE_INPUT_SELECT: u64 = 0x104;
pub const REG_SECURE_CONFIG: u64 = 0x108;
pub const REG_SECURE_CONFIG_EXT: u64 = 0x10C;
pub const REG_SECURE_SECURITY: u64 = 0x110;
pub const REG_HASH_RESULT0: u64 = 0x120;
pub const REG_SECURE_SEC_SEL0: u64 = 0x140;
/// Undocumented alias over two registers of the parsing front-end. A known
/// firmware blob probes it; reproduced literally, not cleaned up.
pub const REG_SXE_FRAME_ALIAS: u64 = 0x1E8;

/// Bus value returned for any access while the engine clock is gated.
pub const CLOCK_GATED_READ: u32 = 1;

pub const CMDQ_OPCODE_SHIFT: u32 = 26;
pub const CMD_BLKSTARTENGINE: u32 = 0x0E;
pub const CMD_DMASETUP: u32 = 0x10;
pub const CMD_DMACOMPLETE: u32 = 0x11;
pub const CMD_SETTABLE: u32 = 0x15;
pub const CMD_FAKE_SECURITY: u32 = 0x1F;
pub const CMD_MEMDMAVD: u32 = 0x22;

/// `BLKSTARTENGINE` operand: block count minus one.
pub const BLKSTART_COUNT_MASK: u32 = 0x000F_FFFF;

pub const SETTABLE_TABLE_SEL_SHIFT: u32 = 24;
const SETTABLE_TABLE_SEL_FIELD: u32 = 0x3;
pub const TABLE_SEL_CRYPTO_KEY: u32 = 0x3;
pub const SETTABLE_VRAM_SEL: u32 = 1 << 23;
pub const SETTABLE_SLOT_SHIFT: u32 = 17;
/// Key-table location as a word offset from the boot-memory base.
pub const SETTABLE_ADDR_MASK: u32 = 0x0001_FFFF;

/// Set when a cipher run completes. Self-clears on read; reading or clearing
/// it also drops the interrupt line.
pub const INTR_CMDQUE_DONE: u32 = 1 << 0;
const INTR_WRITE_CLEAR_MASK: u32 = 0x0000_000F;

/// `SECURE_SEC_SEL[i]` bit 0: key-table fetches may overwrite slot `i`.
/// Cleared by firmware to write-protect the slot.
pub const SEC_SEL_KEY_UPDATE_ENB: u32 = 1 << 0;
const SEC_SEL_WRITE_MASK: u32 = 0x0000_0003;

const SECURE_SECURITY_WRITE_MASK: u32 = 0x0000_01FF;
const SECURE_SECURITY_RESET: u32 = 0;

const SXE_FRAME_BITS_MASK: u32 = 0x000F_FFFF;

pub const KEY_SLOTS: usize = 8;
const KEY_BYTES: usize = 32;
const IV_BYTES: usize = 16;

/// Output a bypass run writes to the start of the destination buffer instead
/// of ciphertext. Firmware compares these exact bytes; do not change them.
pub const SECURE_BOOT_FAKE_PATTERN: [u8; 16] = [
    0xf0, 0x1d, 0xab, 0x1e, 0x5e, 0xcb, 0x00, 0x07, 0xf0, 0x1d, 0xab, 0x1e, 0x5e, 0xcb, 0x00,
    0x07,
];

bitflags! {
    /// Engine state as the hardware keeps it: an OR of independent sticky
    /// flags, not a single enumerated state. `LOADED` and `FAKE` genuinely
    /// coexist with the rest, so this must stay a flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineState: u32 {
        /// The next command-queue word is consumed as the DMA source address.
        const DMA_SETUP = 1 << 0;
        /// A table copy into VRAM was requested (path unimplemented).
        const COPY_TO_VRAM = 1 << 1;
        /// Key material has been fetched into at least one slot since reset.
        const LOADED = 1 << 2;
        /// Secure-boot bypass armed: cipher runs emit the canned pattern.
        const FAKE = 1 << 3;
    }
}

/// Fatal engine conditions. There is no recovery path: wrong cryptographic
/// output must never reach the guest, so the machine stops instead.
#[derive(Debug, Error)]
pub enum EngineFault {
    #[error("unimplemented cipher configuration: RNG enabled without CBC chaining")]
    RngWithoutCbc,
    #[error("DMA window mapping failed: {0}")]
    Dma(#[from] GuestMemoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BseKind {
    Video,
    Audio,
}

impl BseKind {
    pub fn name(self) -> &'static str {
        match self {
            BseKind::Video => "bsev",
            BseKind::Audio => "bsea",
        }
    }
}

/// Construction-time configuration. The key-schedule pair is a hardware
/// strap: fixed for the engine's lifetime and carried through snapshots.
#[derive(Debug, Clone)]
pub struct BseConfig {
    /// Whether firmware probes see the extended (per-round) key schedule.
    pub extended_key_schedule: bool,
    /// Byte length of the expanded key schedule reported to firmware.
    pub key_schedule_length: u32,
    /// Physical base of the on-chip boot memory holding fetched key tables.
    pub key_table_base: u64,
}

impl Default for BseConfig {
    fn default() -> Self {
        Self {
            extended_key_schedule: true,
            key_schedule_length: 176,
            key_table_base: 0x4000_0000,
        }
    }
}

/// `SECURE_INPUT_SELECT` bit fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureInputSelect(pub u32);

impl SecureInputSelect {
    const XOR_POS_SHIFT: u32 = 3;
    const XOR_POS_FIELD: u32 = 0x3;
    const ENCRYPT: u32 = 1 << 8;
    const RNG_ENB: u32 = 1 << 11;
    const KEY_LENGTH_SHIFT: u32 = 16;
    const KEY_LENGTH_FIELD: u32 = 0x3;

    pub fn xor_pos(self) -> u32 {
        (self.0 >> Self::XOR_POS_SHIFT) & Self::XOR_POS_FIELD
    }

    /// CBC chaining is selected by the top bit of the XOR-position field;
    /// a zero field (XOR disabled) falls back to ECB.
    pub fn cbc_chained(self) -> bool {
        self.xor_pos() & 0b10 != 0
    }

    pub fn encrypt(self) -> bool {
        self.0 & Self::ENCRYPT != 0
    }

    pub fn rng_enabled(self) -> bool {
        self.0 & Self::RNG_ENB != 0
    }

    /// `None` for the reserved selector value.
    pub fn key_length(self) -> Option<KeyLength> {
        match (self.0 >> Self::KEY_LENGTH_SHIFT) & Self::KEY_LENGTH_FIELD {
            0 => Some(KeyLength::Aes128),
            1 => Some(KeyLength::Aes192),
            2 => Some(KeyLength::Aes256),
            _ => None,
        }
    }

    pub fn with_xor_pos(self, pos: u32) -> Self {
        let cleared = self.0 & !(Self::XOR_POS_FIELD << Self::XOR_POS_SHIFT);
        Self(cleared | ((pos & Self::XOR_POS_FIELD) << Self::XOR_POS_SHIFT))
    }

    pub fn with_encrypt(self, encrypt: bool) -> Self {
        if encrypt {
            Self(self.0 | Self::ENCRYPT)
        } else {
            Self(self.0 & !Self::ENCRYPT)
        }
    }

    pub fn with_rng_enabled(self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | Self::RNG_ENB)
        } else {
            Self(self.0 & !Self::RNG_ENB)
        }
    }

    pub fn with_key_length(self, key_len: KeyLength) -> Self {
        let cleared = self.0 & !(Self::KEY_LENGTH_FIELD << Self::KEY_LENGTH_SHIFT);
        Self(cleared | (key_len.selector() << Self::KEY_LENGTH_SHIFT))
    }
}

/// `SECURE_CONFIG` bit fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureConfig(pub u32);

impl SecureConfig {
    const KEY_INDEX_SHIFT: u32 = 20;
    const KEY_INDEX_FIELD: u32 = 0x7;

    /// Active slot index; the field is 3 bits wide, so the value is always
    /// in range and never rejected.
    pub fn key_index(self) -> usize {
        ((self.0 >> Self::KEY_INDEX_SHIFT) & Self::KEY_INDEX_FIELD) as usize
    }

    pub fn with_key_index(self, index: usize) -> Self {
        let cleared = self.0 & !(Self::KEY_INDEX_FIELD << Self::KEY_INDEX_SHIFT);
        Self(cleared | (((index as u32) & Self::KEY_INDEX_FIELD) << Self::KEY_INDEX_SHIFT))
    }
}

/// Descriptor of a storage-only register: dispatch, reset, and the test
/// harness all enumerate this table instead of a hand-written switch.
#[derive(Debug, Clone, Copy)]
struct RegDef {
    offset: u64,
    name: &'static str,
    write_mask: u32,
    reset: u32,
}

const NUM_PLAIN_REGS: usize = 19;

const IDX_CMDQUE_CONTROL: usize = 0;
const IDX_SECURE_DEST_ADDR: usize = 3;
const IDX_SECURE_INPUT_SELECT: usize = 4;
const IDX_SECURE_CONFIG: usize = 5;
const IDX_SECURE_SEC_SEL0: usize = 11;

const PLAIN_REGS: [RegDef; NUM_PLAIN_REGS] = [
    RegDef { offset: REG_CMDQUE_CONTROL, name: "CMDQUE_CONTROL", write_mask: 0x0000_01FF, reset: 0 },
    RegDef { offset: REG_BSE_INT_ENB, name: "BSE_INT_ENB", write_mask: 0x0000_0003, reset: 0 },
    RegDef { offset: REG_BSE_CONFIG, name: "BSE_CONFIG", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_SECURE_DEST_ADDR, name: "SECURE_DEST_ADDR", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_SECURE_INPUT_SELECT, name: "SECURE_INPUT_SELECT", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_SECURE_CONFIG, name: "SECURE_CONFIG", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_SECURE_CONFIG_EXT, name: "SECURE_CONFIG_EXT", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_HASH_RESULT0, name: "HASH_RESULT0", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_HASH_RESULT0 + 0x4, name: "HASH_RESULT1", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_HASH_RESULT0 + 0x8, name: "HASH_RESULT2", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_HASH_RESULT0 + 0xC, name: "HASH_RESULT3", write_mask: 0xFFFF_FFFF, reset: 0 },
    RegDef { offset: REG_SECURE_SEC_SEL0, name: "SECURE_SEC_SEL0", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x04, name: "SECURE_SEC_SEL1", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x08, name: "SECURE_SEC_SEL2", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x0C, name: "SECURE_SEC_SEL3", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x10, name: "SECURE_SEC_SEL4", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x14, name: "SECURE_SEC_SEL5", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x18, name: "SECURE_SEC_SEL6", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
    RegDef { offset: REG_SECURE_SEC_SEL0 + 0x1C, name: "SECURE_SEC_SEL7", write_mask: SEC_SEL_WRITE_MASK, reset: SEC_SEL_KEY_UPDATE_ENB },
];

fn plain_index(offset: u64) -> Option<usize> {
    PLAIN_REGS.iter().position(|def| def.offset == offset)
}

/// Enumerates the storage-only registers as `(offset, name, reset value)`.
pub fn plain_registers() -> impl Iterator<Item = (u64, &'static str, u32)> {
    PLAIN_REGS.iter().map(|def| (def.offset, def.name, def.reset))
}

#[derive(Debug, Clone, Copy)]
struct KeySlot {
    key: [u8; KEY_BYTES],
    iv: [u8; IV_BYTES],
}

impl KeySlot {
    const ZERO: KeySlot = KeySlot {
        key: [0; KEY_BYTES],
        iv: [0; IV_BYTES],
    };
}

/// One security engine instance (video or audio).
///
/// The engine owns its interrupt line and clock gate; guest memory is passed
/// into each write call because command words may trigger DMA. The
/// `SECURE_SECURITY` register cell and the front-end register block are
/// shared handles wired in at machine construction, so the cross-instance
/// state is visible at the type level rather than living in globals.
pub struct BseEngine<G: ClockGate> {
    kind: BseKind,
    cfg: BseConfig,
    gate: G,
    irq: Box<dyn IrqLine>,

    state: EngineState,
    pending_src_addr: u32,
    intr_status: u32,
    plain: [u32; NUM_PLAIN_REGS],
    secure_security: Rc<Cell<u32>>,
    slots: [KeySlot; KEY_SLOTS],

    sxe: Option<Rc<RefCell<SxeRegs>>>,
}

impl<G: ClockGate> BseEngine<G> {
    pub fn new(
        kind: BseKind,
        cfg: BseConfig,
        gate: G,
        irq: Box<dyn IrqLine>,
        secure_security: Rc<Cell<u32>>,
        sxe: Option<Rc<RefCell<SxeRegs>>>,
    ) -> Self {
        debug_assert_eq!(PLAIN_REGS[IDX_CMDQUE_CONTROL].offset, REG_CMDQUE_CONTROL);
        debug_assert_eq!(PLAIN_REGS[IDX_SECURE_SEC_SEL0].offset, REG_SECURE_SEC_SEL0);

        let mut engine = Self {
            kind,
            cfg,
            gate,
            irq,
            state: EngineState::empty(),
            pending_src_addr: 0,
            intr_status: 0,
            plain: [0; NUM_PLAIN_REGS],
            secure_security,
            slots: [KeySlot::ZERO; KEY_SLOTS],
            sxe,
        };
        engine.reset();
        engine
    }

    pub fn kind(&self) -> BseKind {
        self.kind
    }

    pub fn config(&self) -> &BseConfig {
        &self.cfg
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Source physical address latched by the last `DMASETUP` operand.
    pub fn dma_source(&self) -> u32 {
        self.pending_src_addr
    }

    pub fn intr_asserted(&self) -> bool {
        self.intr_status & INTR_CMDQUE_DONE != 0
    }

    pub fn slot_key(&self, slot: usize) -> &[u8; KEY_BYTES] {
        &self.slots[slot & (KEY_SLOTS - 1)].key
    }

    /// Provisions a slot IV at machine bring-up. The IV has no register or
    /// command path; hardware expects it pre-loaded or zero.
    pub fn set_slot_iv(&mut self, slot: usize, iv: [u8; IV_BYTES]) {
        self.slots[slot & (KEY_SLOTS - 1)].iv = iv;
    }

    /// Hardware reset: IDLE state, zeroed slots, documented register
    /// defaults, interrupt line dropped. The only thing that disarms a
    /// bypass besides `DMACOMPLETE`.
    pub fn reset(&mut self) {
        self.state = EngineState::empty();
        self.pending_src_addr = 0;
        self.intr_status = 0;
        for (value, def) in self.plain.iter_mut().zip(PLAIN_REGS.iter()) {
            *value = def.reset;
        }
        self.secure_security.set(SECURE_SECURITY_RESET);
        self.slots = [KeySlot::ZERO; KEY_SLOTS];
        self.irq.set_level(false);
    }

    pub fn mmio_read(&mut self, offset: u64) -> u32 {
        if !self.gate.clock_enabled() {
            trace!(
                "{}: read 0x{offset:03x} while clock-gated, returning sentinel",
                self.kind.name()
            );
            return CLOCK_GATED_READ;
        }

        match offset {
            REG_ICMDQUE_WR => 0, // write-only port
            REG_INTR_STATUS => self.read_intr_status(),
            REG_SECURE_SECURITY => self.secure_security.get(),
            REG_SXE_FRAME_ALIAS => self.read_sxe_alias(),
            _ => match plain_index(offset) {
                Some(index) => self.plain[index],
                None => {
                    trace!("{}: read of unmapped offset 0x{offset:03x}", self.kind.name());
                    0
                }
            },
        }
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        value: u32,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), EngineFault> {
        if !self.gate.clock_enabled() {
            trace!(
                "{}: dropped write 0x{offset:03x}=0x{value:08x} while clock-gated",
                self.kind.name()
            );
            return Ok(());
        }
        if self.gate.reset_asserted() {
            // Dropped, but the attempted value stays visible to a tracer.
            debug!(
                "{}: dropped write 0x{offset:03x}=0x{value:08x} while reset asserted",
                self.kind.name()
            );
            return Ok(());
        }

        match offset {
            REG_ICMDQUE_WR => self.icmdque_write(value, mem),
            REG_INTR_STATUS => {
                let cleared = value & INTR_WRITE_CLEAR_MASK;
                self.intr_status &= !cleared;
                if cleared & INTR_CMDQUE_DONE != 0 {
                    self.irq.set_level(false);
                }
                Ok(())
            }
            REG_SECURE_SECURITY => {
                let prev = self.secure_security.get();
                self.secure_security.set(
                    (prev & !SECURE_SECURITY_WRITE_MASK) | (value & SECURE_SECURITY_WRITE_MASK),
                );
                Ok(())
            }
            _ => {
                match plain_index(offset) {
                    Some(index) => {
                        let def = &PLAIN_REGS[index];
                        self.plain[index] =
                            (self.plain[index] & !def.write_mask) | (value & def.write_mask);
                    }
                    None => trace!(
                        "{}: write to unmapped offset 0x{offset:03x}=0x{value:08x}",
                        self.kind.name()
                    ),
                }
                Ok(())
            }
        }
    }

    fn read_intr_status(&mut self) -> u32 {
        let value = self.intr_status;
        if value & INTR_CMDQUE_DONE != 0 {
            // Edge semantics: the done bit self-clears on read and the line
            // drops with it. Reading this register is not idempotent.
            self.intr_status &= !INTR_CMDQUE_DONE;
            self.irq.set_level(false);
        }
        value
    }

    fn read_sxe_alias(&self) -> u32 {
        match &self.sxe {
            Some(sxe) => {
                let sxe = sxe.borrow();
                (sxe.frame_bits() & SXE_FRAME_BITS_MASK).wrapping_add(sxe.slice_count())
            }
            None => 0,
        }
    }

    fn icmdque_write(&mut self, word: u32, mem: &mut dyn GuestMemory) -> Result<(), EngineFault> {
        // Operand consumption comes before opcode dispatch: the word after
        // DMASETUP is always the source address, even if it would decode as
        // another command (including a second DMASETUP).
        if self.state.contains(EngineState::DMA_SETUP) {
            self.pending_src_addr = word;
            self.state.remove(EngineState::DMA_SETUP);
            trace!("{}: latched DMA source 0x{word:08x}", self.kind.name());
            return Ok(());
        }

        let opcode = word >> CMDQ_OPCODE_SHIFT;
        match opcode {
            CMD_SETTABLE => self.cmd_set_table(word, mem)?,
            CMD_DMASETUP => {
                self.state.insert(EngineState::DMA_SETUP);
            }
            CMD_DMACOMPLETE => {
                // Back to IDLE with every sticky flag disarmed, FAKE included.
                self.state = EngineState::empty();
            }
            CMD_BLKSTARTENGINE => {
                let blocks = (word & BLKSTART_COUNT_MASK) + 1;
                self.execute_cipher(blocks as usize, mem)?;
                // IDLE again, but LOADED and an armed bypass survive the run.
                self.state &= EngineState::FAKE | EngineState::LOADED;
                self.intr_status |= INTR_CMDQUE_DONE;
                self.irq.set_level(true);
            }
            CMD_MEMDMAVD => {
                debug!("{}: MEMDMAVD 0x{word:08x} ignored", self.kind.name());
            }
            CMD_FAKE_SECURITY => {
                warn!("{}: secure-boot bypass armed", self.kind.name());
                self.state.insert(EngineState::FAKE);
            }
            _ => {
                debug!(
                    "{}: unknown command-queue opcode 0x{opcode:02x} (word 0x{word:08x})",
                    self.kind.name()
                );
            }
        }
        Ok(())
    }

    fn cmd_set_table(&mut self, word: u32, mem: &mut dyn GuestMemory) -> Result<(), EngineFault> {
        if word & SETTABLE_VRAM_SEL != 0 {
            // Table copy into VRAM. No firmware we run has needed it.
            debug!(
                "{}: SETTABLE targeting VRAM is not implemented (word 0x{word:08x})",
                self.kind.name()
            );
            return Ok(());
        }
        let table_sel = (word >> SETTABLE_TABLE_SEL_SHIFT) & SETTABLE_TABLE_SEL_FIELD;
        if table_sel != TABLE_SEL_CRYPTO_KEY {
            debug!(
                "{}: unknown SETTABLE sub-command 0x{word:08x}",
                self.kind.name()
            );
            return Ok(());
        }
        let slot = ((word >> SETTABLE_SLOT_SHIFT) as usize) & (KEY_SLOTS - 1);
        let addr = self.cfg.key_table_base + u64::from((word & SETTABLE_ADDR_MASK) << 2);
        self.fetch_key_table(slot, addr, mem)
    }

    fn fetch_key_table(
        &mut self,
        slot: usize,
        addr: u64,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), EngineFault> {
        if self.slot_write_protected(slot) {
            // Hardware contract: fetches into a protected slot vanish
            // silently. Not an error, and never surfaced as one.
            debug!(
                "{}: key table fetch into protected slot {slot} ignored",
                self.kind.name()
            );
            return Ok(());
        }
        let mut key = [0u8; KEY_BYTES];
        mem.read_into(addr, &mut key)?;
        self.slots[slot].key = key;
        self.state.insert(EngineState::LOADED);
        trace!(
            "{}: loaded key table into slot {slot} from 0x{addr:08x}",
            self.kind.name()
        );
        Ok(())
    }

    fn slot_write_protected(&self, slot: usize) -> bool {
        self.plain[IDX_SECURE_SEC_SEL0 + slot] & SEC_SEL_KEY_UPDATE_ENB == 0
    }

    fn execute_cipher(
        &mut self,
        blocks: usize,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), EngineFault> {
        let len = blocks * AES_BLOCK_SIZE;
        let src = u64::from(self.pending_src_addr);
        let dst = u64::from(self.plain[IDX_SECURE_DEST_ADDR]);

        // Both DMA windows must map before a single byte moves, bypass
        // included. The guest is assumed to always supply valid ranges;
        // violating that is unrecoverable.
        mem.check_range(src, len)?;
        mem.check_range(dst, len)?;

        if self.state.contains(EngineState::FAKE) {
            mem.write_from(dst, &SECURE_BOOT_FAKE_PATTERN)?;
            debug!(
                "{}: bypass run, canned pattern written to 0x{dst:08x}",
                self.kind.name()
            );
            return Ok(());
        }

        let input = SecureInputSelect(self.plain[IDX_SECURE_INPUT_SELECT]);
        let chain = if input.cbc_chained() {
            ChainMode::Cbc
        } else if input.rng_enabled() {
            // RNG without CBC chaining is a gap in the original hardware
            // model; completing it with guessed semantics would mask a
            // compatibility problem.
            return Err(EngineFault::RngWithoutCbc);
        } else {
            ChainMode::Ecb
        };
        let dir = if input.encrypt() {
            Direction::Encrypt
        } else {
            Direction::Decrypt
        };
        let key_len = input.key_length().unwrap_or_else(|| {
            warn!(
                "{}: reserved key-length selector, assuming AES-256",
                self.kind.name()
            );
            KeyLength::Aes256
        });
        let slot = self.slots[SecureConfig(self.plain[IDX_SECURE_CONFIG]).key_index()];

        let mut buf = vec![0u8; len];
        mem.read_into(src, &mut buf)?;
        cipher::run(&slot.key, &slot.iv, key_len, chain, dir, &mut buf);
        mem.write_from(dst, &buf)?;
        trace!(
            "{}: {chain:?} {dir:?} run of {blocks} block(s) 0x{src:08x} -> 0x{dst:08x}",
            self.kind.name()
        );
        Ok(())
    }
}

impl<G: ClockGate> IoSnapshot for BseEngine<G> {
    const DEVICE_ID: [u8; 4] = *b"BSEC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_STATE: u16 = 1;
        const TAG_PENDING_SRC: u16 = 2;
        const TAG_INTR_STATUS: u16 = 3;
        const TAG_PLAIN_REGS: u16 = 4;
        const TAG_SECURITY: u16 = 5;
        const TAG_SLOTS: u16 = 6;
        const TAG_EXT_SCHEDULE: u16 = 7;
        const TAG_SCHEDULE_LEN: u16 = 8;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_STATE, self.state.bits());
        w.field_u32(TAG_PENDING_SRC, self.pending_src_addr);
        w.field_u32(TAG_INTR_STATUS, self.intr_status);

        let mut enc = Encoder::new().u32(NUM_PLAIN_REGS as u32);
        for value in self.plain {
            enc = enc.u32(value);
        }
        w.field_bytes(TAG_PLAIN_REGS, enc.finish());

        w.field_u32(TAG_SECURITY, self.secure_security.get());

        let mut enc = Encoder::new().u32(KEY_SLOTS as u32);
        for slot in &self.slots {
            enc = enc.bytes(&slot.key).bytes(&slot.iv);
        }
        w.field_bytes(TAG_SLOTS, enc.finish());

        w.field_bool(TAG_EXT_SCHEDULE, self.cfg.extended_key_schedule);
        w.field_u32(TAG_SCHEDULE_LEN, self.cfg.key_schedule_length);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_STATE: u16 = 1;
        const TAG_PENDING_SRC: u16 = 2;
        const TAG_INTR_STATUS: u16 = 3;
        const TAG_PLAIN_REGS: u16 = 4;
        const TAG_SECURITY: u16 = 5;
        const TAG_SLOTS: u16 = 6;
        const TAG_EXT_SCHEDULE: u16 = 7;
        const TAG_SCHEDULE_LEN: u16 = 8;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // The key-schedule pair is a construction-time strap; a snapshot
        // from a differently-strapped machine is not loadable.
        if let Some(ext) = r.bool(TAG_EXT_SCHEDULE)? {
            if ext != self.cfg.extended_key_schedule {
                return Err(SnapshotError::InvalidFieldEncoding(
                    "extended key schedule mismatch",
                ));
            }
        }
        if let Some(len) = r.u32(TAG_SCHEDULE_LEN)? {
            if len != self.cfg.key_schedule_length {
                return Err(SnapshotError::InvalidFieldEncoding(
                    "key schedule length mismatch",
                ));
            }
        }

        self.reset();

        if let Some(bits) = r.u32(TAG_STATE)? {
            self.state = EngineState::from_bits_truncate(bits);
        }
        if let Some(addr) = r.u32(TAG_PENDING_SRC)? {
            self.pending_src_addr = addr;
        }
        if let Some(status) = r.u32(TAG_INTR_STATUS)? {
            self.intr_status = status;
        }
        if let Some(payload) = r.bytes(TAG_PLAIN_REGS) {
            let mut d = Decoder::new(payload);
            let count = d.u32()? as usize;
            for index in 0..count {
                let value = d.u32()?;
                if index < NUM_PLAIN_REGS {
                    self.plain[index] = value & PLAIN_REGS[index].write_mask;
                }
            }
            d.finish()?;
        }
        if let Some(security) = r.u32(TAG_SECURITY)? {
            self.secure_security.set(security);
        }
        if let Some(payload) = r.bytes(TAG_SLOTS) {
            let mut d = Decoder::new(payload);
            let count = d.u32()? as usize;
            for index in 0..count {
                let key = d.bytes(KEY_BYTES)?;
                let iv = d.bytes(IV_BYTES)?;
                if index < KEY_SLOTS {
                    self.slots[index].key.copy_from_slice(key);
                    self.slots[index].iv.copy_from_slice(iv);
                }
            }
            d.finish()?;
        }

        // The interrupt line is a runtime handshake with the platform
        // controller and is not re-driven here; callers restore it from
        // `intr_asserted()` after both sides have loaded.
        Ok(())
    }
}

/// [`MmioHandler`] adapter bundling an engine with its DMA memory handle.
///
/// The handler trait has no error channel — neither does the real register
/// bus — so a fatal engine fault terminates the machine here rather than
/// letting a run complete with undefined output.
pub struct BseMmio<G: ClockGate> {
    engine: BseEngine<G>,
    mem: Rc<RefCell<dyn GuestMemory>>,
}

impl<G: ClockGate> BseMmio<G> {
    pub fn new(engine: BseEngine<G>, mem: Rc<RefCell<dyn GuestMemory>>) -> Self {
        Self { engine, mem }
    }

    pub fn engine(&self) -> &BseEngine<G> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut BseEngine<G> {
        &mut self.engine
    }
}

impl<G: ClockGate> MmioHandler for BseMmio<G> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        assert_eq!(size, 4);
        u64::from(self.engine.mmio_read(offset))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        assert_eq!(size, 4);
        let mut mem = self.mem.borrow_mut();
        if let Err(fault) = self.engine.mmio_write(offset, value as u32, &mut *mem) {
            panic!("{} engine fault: {fault}", self.engine.kind().name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{AlwaysOnGate, ManualGate};
    use crate::irq::LevelIrqLine;
    use kestrel_mem::VecGuestMemory;

    fn test_config() -> BseConfig {
        BseConfig {
            key_table_base: 0,
            ..BseConfig::default()
        }
    }

    fn engine_with_gate<G: ClockGate>(gate: G) -> (BseEngine<G>, LevelIrqLine) {
        let irq = LevelIrqLine::new();
        let engine = BseEngine::new(
            BseKind::Video,
            test_config(),
            gate,
            Box::new(irq.clone()),
            Rc::new(Cell::new(0)),
            None,
        );
        (engine, irq)
    }

    fn engine() -> (BseEngine<AlwaysOnGate>, LevelIrqLine) {
        engine_with_gate(AlwaysOnGate)
    }

    fn cmd(opcode: u32, operand: u32) -> u32 {
        (opcode << CMDQ_OPCODE_SHIFT) | operand
    }

    fn settable_key_fetch(slot: u32, word_offset: u32) -> u32 {
        cmd(
            CMD_SETTABLE,
            (TABLE_SEL_CRYPTO_KEY << SETTABLE_TABLE_SEL_SHIFT)
                | (slot << SETTABLE_SLOT_SHIFT)
                | (word_offset & SETTABLE_ADDR_MASK),
        )
    }

    #[test]
    fn reset_applies_documented_defaults() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);

        engine
            .mmio_write(REG_SECURE_DEST_ADDR, 0x1234_5678, &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_SECURE_SEC_SEL0, 0, &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_ICMDQUE_WR, cmd(CMD_FAKE_SECURITY, 0), &mut mem)
            .unwrap();
        assert!(engine.state().contains(EngineState::FAKE));

        engine.reset();

        assert_eq!(engine.state(), EngineState::empty());
        assert_eq!(engine.dma_source(), 0);
        for (offset, name, reset) in plain_registers() {
            assert_eq!(engine.mmio_read(offset), reset, "{name} reset value");
        }
        for slot in 0..KEY_SLOTS {
            assert_eq!(engine.slot_key(slot), &[0u8; 32]);
        }
    }

    #[test]
    fn clock_gated_reads_return_sentinel_and_writes_are_dropped() {
        let gate = ManualGate::new();
        let (mut engine, _irq) = engine_with_gate(gate.clone());
        let mut mem = VecGuestMemory::new(0x1000);

        gate.set_clock_enabled(false);
        for (offset, name, _) in plain_registers() {
            assert_eq!(engine.mmio_read(offset), CLOCK_GATED_READ, "{name}");
        }
        engine
            .mmio_write(REG_SECURE_DEST_ADDR, 0xFFFF_FFFF, &mut mem)
            .unwrap();

        gate.set_clock_enabled(true);
        assert_eq!(engine.mmio_read(REG_SECURE_DEST_ADDR), 0);
    }

    #[test]
    fn reset_asserted_drops_writes() {
        let gate = ManualGate::new();
        let (mut engine, _irq) = engine_with_gate(gate.clone());
        let mut mem = VecGuestMemory::new(0x1000);

        gate.set_reset_asserted(true);
        engine
            .mmio_write(REG_CMDQUE_CONTROL, 0x1FF, &mut mem)
            .unwrap();
        gate.set_reset_asserted(false);
        assert_eq!(engine.mmio_read(REG_CMDQUE_CONTROL), 0);
    }

    #[test]
    fn unmapped_offsets_read_zero_and_ignore_writes() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        assert_eq!(engine.mmio_read(0x0FC), 0);
        engine.mmio_write(0x0FC, 0xABCD_EF01, &mut mem).unwrap();
        assert_eq!(engine.mmio_read(0x0FC), 0);
    }

    #[test]
    fn write_masks_are_applied() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        engine
            .mmio_write(REG_SECURE_SEC_SEL0 + 0x8, 0xFFFF_FFFF, &mut mem)
            .unwrap();
        assert_eq!(engine.mmio_read(REG_SECURE_SEC_SEL0 + 0x8), 0x3);
    }

    #[test]
    fn protected_slot_ignores_key_fetch() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        mem.write_from(0x100, &[0x77u8; 32]).unwrap();

        // Clearing KEY_UPDATE_ENB write-protects slot 2.
        engine
            .mmio_write(REG_SECURE_SEC_SEL0 + 0x8, 0, &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_ICMDQUE_WR, settable_key_fetch(2, 0x100 >> 2), &mut mem)
            .unwrap();

        assert_eq!(engine.slot_key(2), &[0u8; 32]);
        assert!(!engine.state().contains(EngineState::LOADED));
    }

    #[test]
    fn slot_index_is_masked_to_three_bits() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        mem.write_from(0x40, &[0x5Au8; 32]).unwrap();

        // Slot field 0b1001 aliases slot 1.
        engine
            .mmio_write(REG_ICMDQUE_WR, settable_key_fetch(0x9, 0x40 >> 2), &mut mem)
            .unwrap();
        assert_eq!(engine.slot_key(1), &[0x5Au8; 32]);
        assert!(engine.state().contains(EngineState::LOADED));
    }

    #[test]
    fn settable_vram_and_unknown_subcommands_are_noops() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        mem.write_from(0x40, &[0x5Au8; 32]).unwrap();

        engine
            .mmio_write(
                REG_ICMDQUE_WR,
                cmd(CMD_SETTABLE, SETTABLE_VRAM_SEL | (0x40 >> 2)),
                &mut mem,
            )
            .unwrap();
        engine
            .mmio_write(REG_ICMDQUE_WR, cmd(CMD_SETTABLE, 0x40 >> 2), &mut mem)
            .unwrap();

        for slot in 0..KEY_SLOTS {
            assert_eq!(engine.slot_key(slot), &[0u8; 32]);
        }
        assert_eq!(engine.state(), EngineState::empty());
    }

    #[test]
    fn unknown_opcodes_are_noops() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        engine
            .mmio_write(REG_ICMDQUE_WR, cmd(0x3F, 0x123), &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_ICMDQUE_WR, cmd(CMD_MEMDMAVD, 0x456), &mut mem)
            .unwrap();
        assert_eq!(engine.state(), EngineState::empty());
    }

    #[test]
    fn sxe_alias_adds_masked_frame_bits_to_slice_count() {
        let sxe = Rc::new(RefCell::new(SxeRegs::new()));
        sxe.borrow_mut().set_frame_bits(0xABC1_2345);
        sxe.borrow_mut().set_slice_count(0x0000_0007);

        let irq = LevelIrqLine::new();
        let mut engine = BseEngine::new(
            BseKind::Video,
            test_config(),
            AlwaysOnGate,
            Box::new(irq),
            Rc::new(Cell::new(0)),
            Some(sxe),
        );

        assert_eq!(engine.mmio_read(REG_SXE_FRAME_ALIAS), 0x0001_2345 + 0x7);
    }

    #[test]
    fn security_register_is_shared_between_engines() {
        let shared = Rc::new(Cell::new(0));
        let mut mem = VecGuestMemory::new(0x1000);

        let mut video = BseEngine::new(
            BseKind::Video,
            test_config(),
            AlwaysOnGate,
            Box::new(LevelIrqLine::new()),
            shared.clone(),
            None,
        );
        let mut audio = BseEngine::new(
            BseKind::Audio,
            test_config(),
            AlwaysOnGate,
            Box::new(LevelIrqLine::new()),
            shared,
            None,
        );

        video
            .mmio_write(REG_SECURE_SECURITY, 0x155, &mut mem)
            .unwrap();
        assert_eq!(audio.mmio_read(REG_SECURE_SECURITY), 0x155);
    }

    #[test]
    fn snapshot_round_trips_slots_registers_and_flags() {
        let (mut engine, _irq) = engine();
        let mut mem = VecGuestMemory::new(0x1000);
        mem.write_from(0x80, &[0x33u8; 32]).unwrap();

        engine
            .mmio_write(REG_ICMDQUE_WR, settable_key_fetch(4, 0x80 >> 2), &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_SECURE_DEST_ADDR, 0x0000_2000, &mut mem)
            .unwrap();
        engine
            .mmio_write(REG_ICMDQUE_WR, cmd(CMD_FAKE_SECURITY, 0), &mut mem)
            .unwrap();
        engine.set_slot_iv(4, [0x11u8; 16]);

        let blob = engine.save_state();

        let (mut restored, _irq2) = self::engine();
        restored.load_state(&blob).unwrap();

        assert_eq!(restored.slot_key(4), &[0x33u8; 32]);
        assert_eq!(restored.mmio_read(REG_SECURE_DEST_ADDR), 0x0000_2000);
        assert!(restored.state().contains(EngineState::FAKE));
        assert!(restored.state().contains(EngineState::LOADED));
    }

    #[test]
    fn snapshot_rejects_mismatched_key_schedule_strap() {
        let (engine, _irq) = engine();
        let blob = engine.save_state();

        let irq = LevelIrqLine::new();
        let mut other = BseEngine::new(
            BseKind::Video,
            BseConfig {
                key_schedule_length: 240,
                ..test_config()
            },
            AlwaysOnGate,
            Box::new(irq),
            Rc::new(Cell::new(0)),
            None,
        );
        assert!(other.load_state(&blob).is_err());
    }
}
