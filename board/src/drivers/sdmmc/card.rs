/// Card registers: R1 status, CID and CSD decoding.
use core::fmt;

use super::{CardRegisters, BLOCK_SIZE};

/// CURRENT_STATE from an R1 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Idle,
    Ready,
    Identification,
    Standby,
    Transfer,
    Sending,
    Receiving,
    Programming,
    Disconnected,
    Reserved(u8),
}

impl CardStatus {
    pub const fn from_r1(r1: u32) -> Self {
        match (r1 >> 9) & 0xF {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Identification,
            3 => Self::Standby,
            4 => Self::Transfer,
            5 => Self::Sending,
            6 => Self::Receiving,
            7 => Self::Programming,
            8 => Self::Disconnected,
            other => Self::Reserved(other as u8),
        }
    }

    /// Ready for a new data command.
    pub const fn is_transfer(self) -> bool {
        matches!(self, Self::Transfer)
    }
}

/// Bits `msb..=lsb` of a 128-bit register held most significant word first.
pub(crate) fn field(raw: &[u32; 4], msb: u32, lsb: u32) -> u32 {
    let value = u128::from(raw[0]) << 96
        | u128::from(raw[1]) << 64
        | u128::from(raw[2]) << 32
        | u128::from(raw[3]);
    let width = msb - lsb + 1;
    ((value >> lsb) & ((1u128 << width) - 1)) as u32
}

/// Card identification register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: [u8; 2],
    pub product_name: [u8; 5],
    /// Product revision, major and minor.
    pub revision: (u8, u8),
    pub serial: u32,
    pub manufactured_year: u16,
    pub manufactured_month: u8,
}

impl Cid {
    pub fn decode(raw: &[u32; 4]) -> Self {
        let byte = |msb: u32| field(raw, msb, msb - 7) as u8;
        let revision = byte(63);
        Self {
            manufacturer_id: byte(127),
            oem_id: [byte(119), byte(111)],
            product_name: [byte(103), byte(95), byte(87), byte(79), byte(71)],
            revision: (revision >> 4, revision & 0xF),
            serial: field(raw, 55, 24),
            manufactured_year: 2000 + field(raw, 19, 12) as u16,
            manufactured_month: field(raw, 11, 8) as u8,
        }
    }

    pub fn product_name(&self) -> &str {
        core::str::from_utf8(&self.product_name).unwrap_or("?????")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdVersion {
    /// Standard capacity.
    V1,
    /// High and extended capacity.
    V2,
    /// Ultra capacity.
    V3,
}

/// Card-specific data: what we need of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    pub version: CsdVersion,
    /// Capacity in 512-byte blocks.
    pub block_count: u64,
    pub max_transfer_rate: u8,
}

impl Csd {
    pub fn decode(raw: &[u32; 4]) -> Option<Self> {
        let max_transfer_rate = field(raw, 103, 96) as u8;
        let (version, block_count) = match field(raw, 127, 126) {
            0 => {
                let read_bl_len = field(raw, 83, 80);
                let c_size = u64::from(field(raw, 73, 62));
                let c_size_mult = field(raw, 49, 47);
                let blocks = (c_size + 1) << (c_size_mult + 2);
                let bytes = blocks << read_bl_len;
                (CsdVersion::V1, bytes / u64::from(BLOCK_SIZE))
            }
            1 => {
                let c_size = u64::from(field(raw, 69, 48));
                (CsdVersion::V2, (c_size + 1) * 1024)
            }
            2 => {
                let c_size = u64::from(field(raw, 75, 48));
                (CsdVersion::V3, (c_size + 1) * 1024)
            }
            _ => return None,
        };
        Some(Self {
            version,
            block_count,
            max_transfer_rate,
        })
    }
}

/// What identification learned about the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub cid: Cid,
    pub csd: Csd,
    pub rca: u16,
    /// Block-addressed (SDHC and up) rather than byte-addressed.
    pub high_capacity: bool,
}

impl CardInfo {
    pub fn decode(registers: &CardRegisters) -> Option<Self> {
        Some(Self {
            cid: Cid::decode(&registers.cid),
            csd: Csd::decode(&registers.csd)?,
            rca: registers.rca,
            high_capacity: registers.high_capacity,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.csd.block_count
    }

    pub fn capacity(&self) -> u64 {
        self.csd.block_count * u64::from(BLOCK_SIZE)
    }
}

impl fmt::Display for CardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rev {}.{} sn {:08x} ({:04}-{:02}), {} blocks ({} MiB){}",
            self.cid.product_name(),
            self.cid.revision.0,
            self.cid.revision.1,
            self.cid.serial,
            self.cid.manufactured_year,
            self.cid.manufactured_month,
            self.csd.block_count,
            self.capacity() >> 20,
            if self.high_capacity { ", SDHC" } else { "" }
        )
    }
}
