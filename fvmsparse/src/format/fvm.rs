// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! On-disk FVM metadata and its derivation from a sparse image.
//!
//! An FVM volume starts with two copies of the metadata, followed by the
//! slice data. Each copy consists of a block holding the header, the virtual
//! partition table, and the physical slice allocation table. Index 0 of both
//! tables is reserved.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::{Read, Write},
    mem,
    ops::Range,
    str,
};

use bitflags::bitflags;
use bstr::ByteSlice;
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    descriptor::{FvmOptions, PLACEHOLDER_INSTANCE_GUID, guid},
    format::{
        ErrorKind,
        padding::{self, ZeroPadding},
        sparse::{self, PartitionEntry, PartitionFlags},
    },
    stream::{FromReader, ToWriter},
    util::{DebugString, NumBytes},
};

/// Magic value for [`RawHeader::magic`].
pub const FVM_MAGIC: u64 = 0x54524150204d5646;

/// Supported major version.
pub const MAJOR_VERSION: u64 = 1;

/// Minor version written to new metadata.
pub const CURRENT_MINOR_VERSION: u64 = 1;

/// Size of the block holding the header. The tables are aligned to this too.
pub const BLOCK_SIZE: u64 = 8192;

/// Number of entries in a full virtual partition table, including the
/// reserved entry.
pub const MAX_VPARTITIONS: u64 = 1024;

/// Number of partitions that can actually be used.
pub const MAX_USABLE_PARTITIONS: u64 = MAX_VPARTITIONS - 1;

/// Virtual slice indices are stored in 32 bits.
pub const MAX_VSLICES: u64 = 1 << 32;

pub const NAME_SIZE: usize = 24;

const VPARTITION_ENTRY_SIZE: u64 = mem::size_of::<RawVPartitionEntry>() as u64;
const SLICE_ENTRY_SIZE: u64 = mem::size_of::<little_endian::U64>() as u64;

/// Offset of [`RawHeader::hash`].
const HASH_OFFSET: usize = mem::offset_of!(RawHeader, hash);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid FVM magic: {0:#018x}")]
    InvalidMagic(u64),
    #[error("Unsupported FVM major version: {0}")]
    UnsupportedVersion(u64),
    #[error("Slice size is zero")]
    ZeroSliceSize,
    #[error("Slice size {0} is not a multiple of {BLOCK_SIZE}")]
    SliceSizeUnaligned(u64),
    #[error("Invalid {name} table size: {size}")]
    InvalidTableSize { name: &'static str, size: u64 },
    #[error("Slice count {count} exceeds allocation table capacity {capacity}")]
    TooManySlices { count: u64, capacity: u64 },
    #[error("Too many partitions: {count} > {max}")]
    TooManyPartitions { count: u64, max: u64 },
    #[error("Volume too small: {required:?} needed, but only {available:?} available")]
    VolumeTooSmall {
        required: NumBytes<u64>,
        available: NumBytes<u64>,
    },
    #[error("Need {required} slices, but the volume only has {available}")]
    NotEnoughSlices { required: u64, available: u64 },
    #[error("FVM geometry overflows")]
    GeometryOverflow,
    #[error("Partition #{index}: Invalid name: {name}")]
    InvalidPartitionName { index: u64, name: DebugString },
    #[error("Partition #{index}: Unknown flags: {flags:#010x}")]
    UnknownPartitionFlags { index: u64, flags: u32 },
    #[error("Partition #{index}: Out of bounds of the partition table")]
    PartitionOutOfBounds { index: u64 },
    #[error("Partition #{index}: Extent at slice {slice_start} with {slice_count} slices is out of range")]
    ExtentOutOfRange {
        index: u64,
        slice_start: u64,
        slice_count: u64,
    },
    #[error("Partition #{index}: Slice count overflows")]
    PartitionSliceCountOverflow { index: u64 },
    #[error("Partition #{index}: Allocation table has {actual} slices, but entry says {expected}")]
    AllocationMismatch {
        index: u64,
        expected: u32,
        actual: u64,
    },
    #[error("Slice #{pslice}: Out of bounds of the allocation table")]
    SliceOutOfBounds { pslice: u64 },
    #[error("Slice #{pslice}: Invalid entry: {value:#018x}")]
    InvalidSliceEntry { pslice: u64, value: u64 },
    #[error("Slice #{pslice}: Assigned to unknown partition #{vpartition}")]
    UnknownPartition { pslice: u64, vpartition: u64 },
    #[error("Slice #{pslice}: Virtual slice {vslice} is out of range")]
    VirtualSliceOutOfRange { pslice: u64, vslice: u64 },
    #[error("Slice #{pslice}: Virtual slice {vslice} of partition #{vpartition} is already mapped")]
    DuplicateVirtualSlice {
        pslice: u64,
        vpartition: u64,
        vslice: u64,
    },
    #[error("Expected metadata digest {expected}, but have {actual}")]
    InvalidDigest { expected: String, actual: String },
    #[error("Failed to read FVM data: {0}")]
    DataRead(&'static str, #[source] std::io::Error),
    #[error("Failed to write FVM data: {0}")]
    DataWrite(&'static str, #[source] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMagic(_) => ErrorKind::BadMagic,
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Self::UnknownPartitionFlags { .. } => ErrorKind::UnknownFlag,
            Self::ZeroSliceSize => ErrorKind::ZeroSliceSize,
            Self::ExtentOutOfRange { .. } => ErrorKind::ExtentGeometry,
            Self::VolumeTooSmall { .. } | Self::NotEnoughSlices { .. } => {
                ErrorKind::VolumeTooSmall
            }
            Self::DataRead(_, _) | Self::DataWrite(_, _) => ErrorKind::IoError,
            _ => ErrorKind::InvalidData,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

fn vpartition_table_size(usable_partitions: u64) -> Option<u64> {
    usable_partitions
        .checked_add(1)
        .and_then(|n| n.checked_mul(VPARTITION_ENTRY_SIZE))
        .and_then(|s| padding::round(s, BLOCK_SIZE))
}

fn allocation_table_size(max_slices: u64) -> Option<u64> {
    max_slices
        .checked_add(1)
        .and_then(|n| n.checked_mul(SLICE_ENTRY_SIZE))
        .and_then(|s| padding::round(s, BLOCK_SIZE))
}

/// Raw on-disk layout for the FVM header. It occupies the first
/// [`BLOCK_SIZE`] bytes of each metadata copy.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`FVM_MAGIC`].
    magic: little_endian::U64,
    major_version: little_endian::U64,
    /// Number of usable physical slices.
    pslice_count: little_endian::U64,
    slice_size: little_endian::U64,
    /// Current size of the volume, including both metadata copies.
    fvm_partition_size: little_endian::U64,
    vpartition_table_size: little_endian::U64,
    allocation_table_size: little_endian::U64,
    /// Incremented each time the metadata is updated.
    generation: little_endian::U64,
    /// SHA-256 digest of the metadata copy with this field set to zeros.
    hash: [u8; 32],
    oldest_minor_version: little_endian::U64,
}

const _: () = assert!(mem::size_of::<RawHeader>() as u64 <= BLOCK_SIZE);

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#018x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("pslice_count", &self.pslice_count.get())
            .field("slice_size", &self.slice_size.get())
            .field("fvm_partition_size", &self.fvm_partition_size.get())
            .field("vpartition_table_size", &self.vpartition_table_size.get())
            .field("allocation_table_size", &self.allocation_table_size.get())
            .field("generation", &self.generation.get())
            .field("hash", &hex::encode(self.hash))
            .field("oldest_minor_version", &self.oldest_minor_version.get())
            .finish()
    }
}

/// FVM volume geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub pslice_count: u64,
    pub slice_size: u64,
    pub fvm_partition_size: u64,
    pub vpartition_table_size: u64,
    pub allocation_table_size: u64,
    pub generation: u64,
    pub oldest_minor_version: u64,
}

impl Header {
    /// Header for a fixed-size volume holding exactly `slice_count` slices.
    pub fn from_slice_count(
        usable_partitions: u64,
        slice_count: u64,
        slice_size: u64,
    ) -> Result<Self> {
        Self::from_growable_slice_count(usable_partitions, slice_count, slice_count, slice_size)
    }

    /// Header for a volume holding `initial_slices` slices, with metadata
    /// large enough to grow to `max_slices`.
    pub fn from_growable_slice_count(
        usable_partitions: u64,
        initial_slices: u64,
        max_slices: u64,
        slice_size: u64,
    ) -> Result<Self> {
        let mut header = Self::with_tables(usable_partitions, max_slices, slice_size)?;
        header.set_slice_count(initial_slices)?;

        Ok(header)
    }

    /// Header for a fixed-size volume of `disk_size` bytes.
    pub fn from_disk_size(usable_partitions: u64, disk_size: u64, slice_size: u64) -> Result<Self> {
        Self::from_growable_disk_size(usable_partitions, disk_size, disk_size, slice_size)
    }

    /// Header for a volume of `initial_size` bytes, with metadata large enough
    /// to grow to `max_size` bytes. The slice count is however many whole
    /// slices fit after the metadata.
    pub fn from_growable_disk_size(
        usable_partitions: u64,
        initial_size: u64,
        max_size: u64,
        slice_size: u64,
    ) -> Result<Self> {
        if slice_size == 0 {
            return Err(Error::ZeroSliceSize);
        }

        let mut header = Self::with_tables(usable_partitions, max_size / slice_size, slice_size)?;
        let data_start = header.data_start()?;

        header.pslice_count = initial_size.saturating_sub(data_start) / slice_size;
        header.fvm_partition_size = initial_size;

        Ok(header)
    }

    fn with_tables(usable_partitions: u64, max_slices: u64, slice_size: u64) -> Result<Self> {
        if slice_size == 0 {
            return Err(Error::ZeroSliceSize);
        } else if usable_partitions > MAX_USABLE_PARTITIONS {
            return Err(Error::TooManyPartitions {
                count: usable_partitions,
                max: MAX_USABLE_PARTITIONS,
            });
        }

        Ok(Self {
            pslice_count: 0,
            slice_size,
            fvm_partition_size: 0,
            vpartition_table_size: vpartition_table_size(usable_partitions)
                .ok_or(Error::GeometryOverflow)?,
            allocation_table_size: allocation_table_size(max_slices)
                .ok_or(Error::GeometryOverflow)?,
            generation: 0,
            oldest_minor_version: CURRENT_MINOR_VERSION,
        })
    }

    /// Set the number of slices and resize the volume to fit exactly that many.
    pub fn set_slice_count(&mut self, slice_count: u64) -> Result<()> {
        let size = slice_count
            .checked_mul(self.slice_size)
            .and_then(|s| s.checked_add(self.data_start().ok()?))
            .ok_or(Error::GeometryOverflow)?;

        self.pslice_count = slice_count;
        self.fvm_partition_size = size;

        Ok(())
    }

    /// Size of one copy of the metadata.
    pub fn metadata_size(&self) -> Result<u64> {
        BLOCK_SIZE
            .checked_add(self.vpartition_table_size)
            .and_then(|s| s.checked_add(self.allocation_table_size))
            .ok_or(Error::GeometryOverflow)
    }

    /// Offset of the first physical slice.
    pub fn data_start(&self) -> Result<u64> {
        self.metadata_size()?
            .checked_mul(2)
            .ok_or(Error::GeometryOverflow)
    }

    /// Number of slices the allocation table can describe.
    pub fn max_usable_slices(&self) -> u64 {
        (self.allocation_table_size / SLICE_ENTRY_SIZE).saturating_sub(1)
    }

    /// Number of entries in the partition table, including the reserved entry.
    pub fn max_partitions(&self) -> u64 {
        self.vpartition_table_size / VPARTITION_ENTRY_SIZE
    }

    fn vpartition_table_range(&self) -> Range<u64> {
        BLOCK_SIZE..BLOCK_SIZE + self.vpartition_table_size
    }

    fn allocation_table_range(&self) -> Range<u64> {
        let start = BLOCK_SIZE + self.vpartition_table_size;
        start..start + self.allocation_table_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.slice_size == 0 {
            return Err(Error::ZeroSliceSize);
        } else if self.slice_size % BLOCK_SIZE != 0 {
            return Err(Error::SliceSizeUnaligned(self.slice_size));
        }

        let max_partitions = self.max_partitions();
        if self.vpartition_table_size % BLOCK_SIZE != 0
            || !(2..=MAX_VPARTITIONS).contains(&max_partitions)
        {
            return Err(Error::InvalidTableSize {
                name: "partition",
                size: self.vpartition_table_size,
            });
        }

        if self.allocation_table_size == 0 || self.allocation_table_size % BLOCK_SIZE != 0 {
            return Err(Error::InvalidTableSize {
                name: "allocation",
                size: self.allocation_table_size,
            });
        }

        if self.pslice_count > self.max_usable_slices() {
            return Err(Error::TooManySlices {
                count: self.pslice_count,
                capacity: self.max_usable_slices(),
            });
        }

        let required = self
            .pslice_count
            .checked_mul(self.slice_size)
            .and_then(|s| s.checked_add(self.data_start().ok()?))
            .ok_or(Error::GeometryOverflow)?;
        if self.fvm_partition_size < required {
            return Err(Error::VolumeTooSmall {
                required: NumBytes(required),
                available: NumBytes(self.fvm_partition_size),
            });
        }

        Ok(())
    }

    fn from_raw(raw: &RawHeader) -> Result<Self> {
        if raw.magic.get() != FVM_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        } else if raw.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedVersion(raw.major_version.get()));
        }

        let header = Self {
            pslice_count: raw.pslice_count.get(),
            slice_size: raw.slice_size.get(),
            fvm_partition_size: raw.fvm_partition_size.get(),
            vpartition_table_size: raw.vpartition_table_size.get(),
            allocation_table_size: raw.allocation_table_size.get(),
            generation: raw.generation.get(),
            oldest_minor_version: raw.oldest_minor_version.get(),
        };
        header.validate()?;

        Ok(header)
    }

    fn to_raw(self) -> RawHeader {
        RawHeader {
            magic: FVM_MAGIC.into(),
            major_version: MAJOR_VERSION.into(),
            pslice_count: self.pslice_count.into(),
            slice_size: self.slice_size.into(),
            fvm_partition_size: self.fvm_partition_size.into(),
            vpartition_table_size: self.vpartition_table_size.into(),
            allocation_table_size: self.allocation_table_size.into(),
            generation: self.generation.into(),
            hash: [0u8; 32],
            oldest_minor_version: self.oldest_minor_version.into(),
        }
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct VPartitionFlags: u32 {
        const INACTIVE = 1 << 0;
        const ZXCRYPT = 1 << 1;

        const _ = !0;
    }
}

impl VPartitionFlags {
    pub const MASK: Self = Self::INACTIVE.union(Self::ZXCRYPT);
}

/// Raw on-disk layout for a virtual partition table entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawVPartitionEntry {
    type_guid: [u8; 16],
    instance_guid: [u8; 16],
    /// Number of slices allocated to this partition. Zero if free.
    slices: little_endian::U32,
    flags: little_endian::U32,
    name: [u8; NAME_SIZE],
}

impl RawVPartitionEntry {
    fn is_free(&self) -> bool {
        self.slices.get() == 0
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct VPartitionEntry {
    pub type_guid: [u8; 16],
    pub instance_guid: [u8; 16],
    pub name: String,
    pub slices: u32,
    pub flags: VPartitionFlags,
}

impl fmt::Debug for VPartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VPartitionEntry")
            .field("type_guid", &guid::to_string(&self.type_guid))
            .field("instance_guid", &guid::to_string(&self.instance_guid))
            .field("name", &self.name)
            .field("slices", &self.slices)
            .field("flags", &self.flags)
            .finish()
    }
}

impl VPartitionEntry {
    fn from_raw(raw: &RawVPartitionEntry, index: u64) -> Result<Self> {
        let flags = VPartitionFlags::from_bits_retain(raw.flags.get());
        if !(flags - VPartitionFlags::MASK).is_empty() {
            return Err(Error::UnknownPartitionFlags {
                index,
                flags: flags.bits(),
            });
        }

        let name_bytes = raw.name.trim_end_padding();
        let name = str::from_utf8(name_bytes)
            .ok()
            .filter(|n| !n.contains('\0'))
            .ok_or_else(|| Error::InvalidPartitionName {
                index,
                name: DebugString::new(name_bytes.as_bstr()),
            })?;

        Ok(Self {
            type_guid: raw.type_guid,
            instance_guid: raw.instance_guid,
            name: name.to_owned(),
            slices: raw.slices.get(),
            flags,
        })
    }

    fn to_raw(&self, index: u64) -> Result<RawVPartitionEntry> {
        let name = encode_name(&self.name).ok_or_else(|| Error::InvalidPartitionName {
            index,
            name: DebugString::new(&self.name),
        })?;

        Ok(RawVPartitionEntry {
            type_guid: self.type_guid,
            instance_guid: self.instance_guid,
            slices: self.slices.into(),
            flags: self.flags.bits().into(),
            name,
        })
    }
}

fn encode_name(name: &str) -> Option<[u8; NAME_SIZE]> {
    if name.as_bytes().contains(&0) {
        return None;
    }

    name.as_bytes().to_padded_array()
}

/// Maps a physical slice to a virtual slice of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceEntry {
    pub vpartition: u64,
    pub vslice: u64,
}

impl SliceEntry {
    const VPARTITION_BITS: u32 = 16;
    const VSLICE_BITS: u32 = 32;

    fn decode(value: u64, pslice: u64) -> Result<Option<Self>> {
        if value == 0 {
            return Ok(None);
        } else if value >> (Self::VPARTITION_BITS + Self::VSLICE_BITS) != 0 {
            return Err(Error::InvalidSliceEntry { pslice, value });
        }

        Ok(Some(Self {
            vpartition: value & ((1 << Self::VPARTITION_BITS) - 1),
            vslice: value >> Self::VPARTITION_BITS,
        }))
    }

    fn encode(self) -> u64 {
        self.vpartition | (self.vslice << Self::VPARTITION_BITS)
    }
}

/// One copy of the FVM metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub header: Header,
    /// Virtual partition table, keyed by index. Free entries are omitted.
    pub partitions: BTreeMap<u64, VPartitionEntry>,
    /// Allocation table, keyed by physical slice. Free slices are omitted.
    pub slices: BTreeMap<u64, SliceEntry>,
}

impl Metadata {
    /// Number of physical slices assigned to partitions.
    pub fn allocated_slice_count(&self) -> u64 {
        self.slices.len() as u64
    }

    pub fn validate(&self) -> Result<()> {
        self.header.validate()?;

        let max_partitions = self.header.max_partitions();
        let mut counts = BTreeMap::<u64, u64>::new();

        for (index, entry) in &self.partitions {
            if *index == 0 || *index >= max_partitions {
                return Err(Error::PartitionOutOfBounds { index: *index });
            }

            let flags = entry.flags;
            if !(flags - VPartitionFlags::MASK).is_empty() {
                return Err(Error::UnknownPartitionFlags {
                    index: *index,
                    flags: flags.bits(),
                });
            }

            if encode_name(&entry.name).is_none() {
                return Err(Error::InvalidPartitionName {
                    index: *index,
                    name: DebugString::new(&entry.name),
                });
            }

            counts.insert(*index, 0);
        }

        let mut mapped = BTreeSet::new();

        for (pslice, entry) in &self.slices {
            let pslice = *pslice;

            if pslice == 0 || pslice > self.header.pslice_count {
                return Err(Error::SliceOutOfBounds { pslice });
            }

            let Some(count) = counts.get_mut(&entry.vpartition) else {
                return Err(Error::UnknownPartition {
                    pslice,
                    vpartition: entry.vpartition,
                });
            };

            if entry.vslice >= MAX_VSLICES {
                return Err(Error::VirtualSliceOutOfRange {
                    pslice,
                    vslice: entry.vslice,
                });
            }

            if !mapped.insert((entry.vpartition, entry.vslice)) {
                return Err(Error::DuplicateVirtualSlice {
                    pslice,
                    vpartition: entry.vpartition,
                    vslice: entry.vslice,
                });
            }

            *count += 1;
        }

        for (index, entry) in &self.partitions {
            let actual = counts.get(index).copied().unwrap_or_default();
            if actual != u64::from(entry.slices) {
                return Err(Error::AllocationMismatch {
                    index: *index,
                    expected: entry.slices,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Serialize one copy of the metadata, including the digest.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let size = usize::try_from(self.header.metadata_size()?)
            .map_err(|_| Error::GeometryOverflow)?;
        let mut buf = vec![0u8; size];

        let raw_header = self.header.to_raw();
        buf[..mem::size_of::<RawHeader>()].copy_from_slice(raw_header.as_bytes());

        let table_start = self.header.vpartition_table_range().start as usize;
        for (index, entry) in &self.partitions {
            let offset = table_start + (*index * VPARTITION_ENTRY_SIZE) as usize;
            let raw = entry.to_raw(*index)?;

            buf[offset..offset + VPARTITION_ENTRY_SIZE as usize].copy_from_slice(raw.as_bytes());
        }

        let table_start = self.header.allocation_table_range().start as usize;
        for (pslice, entry) in &self.slices {
            let offset = table_start + (*pslice * SLICE_ENTRY_SIZE) as usize;
            let raw = little_endian::U64::new(entry.encode());

            buf[offset..offset + SLICE_ENTRY_SIZE as usize].copy_from_slice(raw.as_bytes());
        }

        let hash = digest(&SHA256, &buf);
        buf[HASH_OFFSET..HASH_OFFSET + 32].copy_from_slice(hash.as_ref());

        Ok(buf)
    }

    /// Parse one copy of the metadata from `buf`, which holds exactly
    /// [`Header::metadata_size`] bytes.
    fn from_bytes(header: Header, buf: &mut [u8]) -> Result<Self> {
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&buf[HASH_OFFSET..HASH_OFFSET + 32]);
        buf[HASH_OFFSET..HASH_OFFSET + 32].fill(0);

        #[cfg(not(fuzzing))]
        {
            let actual = digest(&SHA256, buf);
            if actual.as_ref() != expected {
                return Err(Error::InvalidDigest {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }

        let mut partitions = BTreeMap::new();
        let range = header.vpartition_table_range();
        let table = &buf[range.start as usize..range.end as usize];

        for (index, chunk) in table
            .chunks_exact(VPARTITION_ENTRY_SIZE as usize)
            .enumerate()
            .skip(1)
        {
            let index = index as u64;
            // The chunk size matches the struct size.
            let Ok(raw) = RawVPartitionEntry::read_from_bytes(chunk) else {
                continue;
            };

            if !raw.is_free() {
                partitions.insert(index, VPartitionEntry::from_raw(&raw, index)?);
            }
        }

        let mut slices = BTreeMap::new();
        let range = header.allocation_table_range();
        let table = &buf[range.start as usize..range.end as usize];

        for (pslice, chunk) in table
            .chunks_exact(SLICE_ENTRY_SIZE as usize)
            .enumerate()
            .skip(1)
        {
            let pslice = pslice as u64;
            let Ok(raw) = little_endian::U64::read_from_bytes(chunk) else {
                continue;
            };

            if let Some(entry) = SliceEntry::decode(raw.get(), pslice)? {
                slices.insert(pslice, entry);
            }
        }

        let metadata = Self {
            header,
            partitions,
            slices,
        };
        metadata.validate()?;

        Ok(metadata)
    }
}

/// Reads the primary copy of the metadata.
impl<R: Read> FromReader<R> for Metadata {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        reader
            .read_exact(&mut block)
            .map_err(|e| Error::DataRead("header", e))?;

        let mut raw_header = RawHeader::new_zeroed();
        raw_header
            .as_mut_bytes()
            .copy_from_slice(&block[..mem::size_of::<RawHeader>()]);
        trace!("Read FVM header: {raw_header:?}");
        let header = Header::from_raw(&raw_header)?;

        let size = header.metadata_size()?;
        let mut buf = block;

        // Grow as data arrives so a bogus table size cannot force a huge
        // allocation up front.
        (&mut reader)
            .take(size - BLOCK_SIZE)
            .read_to_end(&mut buf)
            .map_err(|e| Error::DataRead("tables", e))?;
        if buf.len() as u64 != size {
            return Err(Error::DataRead(
                "tables",
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }

        Self::from_bytes(header, &mut buf)
    }
}

/// Writes both the primary and secondary copies of the metadata.
impl<W: Write> ToWriter<W> for Metadata {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let buf = self.to_bytes()?;

        for name in ["primary_metadata", "secondary_metadata"] {
            writer
                .write_all(&buf)
                .map_err(|e| Error::DataWrite(name, e))?;
        }

        Ok(())
    }
}

/// Number of slices used by the extents of all partitions. Extents must lie
/// within the virtual address space and each partition's slice count must fit
/// in its table entry.
fn used_slice_count(partitions: &[PartitionEntry]) -> Result<u64> {
    let mut total = 0u64;

    for (i, partition) in partitions.iter().enumerate() {
        let index = i as u64 + 1;
        let mut slice_count = 0u32;

        for extent in &partition.extents {
            if !extent
                .slice_start
                .checked_add(extent.slice_count)
                .is_some_and(|end| end <= MAX_VSLICES)
            {
                return Err(Error::ExtentOutOfRange {
                    index,
                    slice_start: extent.slice_start,
                    slice_count: extent.slice_count,
                });
            }

            slice_count = u32::try_from(extent.slice_count)
                .ok()
                .and_then(|c| slice_count.checked_add(c))
                .ok_or(Error::PartitionSliceCountOverflow { index })?;
        }

        total = total
            .checked_add(slice_count.into())
            .ok_or(Error::GeometryOverflow)?;
    }

    Ok(total)
}

/// Choose the volume geometry for a sparse image. The maximum volume size
/// comes from `options`, falling back to the sparse header's. The volume must
/// hold at least `minimum_slice_count` slices and every slice used by the
/// partitions.
pub fn derive_header(
    sparse_header: &sparse::Header,
    partitions: &[PartitionEntry],
    minimum_slice_count: u64,
    options: &FvmOptions,
) -> Result<Header> {
    let slice_size = sparse_header.slice_size;
    let max_size = options.max_volume_size.or(sparse_header.maximum_disk_size);
    let target_size = options.target_volume_size;
    let minimum_slice_count = minimum_slice_count.max(used_slice_count(partitions)?);

    let base = Header::from_slice_count(MAX_USABLE_PARTITIONS, minimum_slice_count, slice_size)?;

    let header = match (max_size, target_size) {
        (Some(max_size), target_size) => {
            if max_size < base.fvm_partition_size {
                return Err(Error::VolumeTooSmall {
                    required: NumBytes(base.fvm_partition_size),
                    available: NumBytes(max_size),
                });
            }

            let mut header = Header::from_growable_disk_size(
                MAX_USABLE_PARTITIONS,
                target_size.map_or(base.fvm_partition_size, |t| t.min(max_size)),
                max_size,
                slice_size,
            )?;

            // Without a target, the volume is as small as possible.
            if target_size.is_none() {
                header.set_slice_count(minimum_slice_count)?;
            }

            header
        }
        (None, Some(target_size)) => {
            Header::from_disk_size(MAX_USABLE_PARTITIONS, target_size, slice_size)?
        }
        (None, None) => base,
    };

    if header.pslice_count < minimum_slice_count {
        return Err(Error::NotEnoughSlices {
            required: minimum_slice_count,
            available: header.pslice_count,
        });
    }

    header.validate()?;

    debug!(
        "Derived FVM geometry: {} slices of {:?} in {:?}",
        header.pslice_count,
        NumBytes(slice_size),
        NumBytes(header.fvm_partition_size),
    );

    Ok(header)
}

/// Build the partition and slice allocation tables. Partition `i` of the
/// sparse image becomes table entry `i + 1`, and physical slices are assigned
/// in declaration order starting at 1.
pub fn derive_metadata(header: Header, partitions: &[PartitionEntry]) -> Result<Metadata> {
    let count = partitions.len() as u64;
    if count >= header.max_partitions() {
        return Err(Error::TooManyPartitions {
            count,
            max: header.max_partitions().saturating_sub(1),
        });
    }

    let required = used_slice_count(partitions)?;
    if required > header.pslice_count {
        return Err(Error::NotEnoughSlices {
            required,
            available: header.pslice_count,
        });
    }

    let mut vpartitions = BTreeMap::new();
    let mut slices = BTreeMap::new();
    let mut pslice = 1u64;

    for (i, partition) in partitions.iter().enumerate() {
        let index = i as u64 + 1;
        let mut slice_count = 0u32;

        for extent in &partition.extents {
            let end = extent
                .slice_start
                .checked_add(extent.slice_count)
                .ok_or(Error::GeometryOverflow)?;

            for vslice in extent.slice_start..end {
                slices.insert(pslice, SliceEntry {
                    vpartition: index,
                    vslice,
                });
                pslice += 1;
            }

            // Bounded by used_slice_count() above.
            slice_count += extent.slice_count as u32;
        }

        let mut flags = VPartitionFlags::empty();
        if partition.flags.contains(PartitionFlags::ZXCRYPT) {
            flags |= VPartitionFlags::ZXCRYPT;
        }

        vpartitions.insert(index, VPartitionEntry {
            type_guid: partition.type_guid,
            instance_guid: PLACEHOLDER_INSTANCE_GUID,
            name: partition.name.clone(),
            slices: slice_count,
            flags,
        });
    }

    let metadata = Metadata {
        header,
        partitions: vpartitions,
        slices,
    };
    metadata.validate()?;

    Ok(metadata)
}

/// Derive the complete FVM metadata for a sparse image.
pub fn derive_layout(
    sparse_header: &sparse::Header,
    partitions: &[PartitionEntry],
    minimum_slice_count: u64,
    options: &FvmOptions,
) -> Result<Metadata> {
    let header = derive_header(sparse_header, partitions, minimum_slice_count, options)?;

    derive_metadata(header, partitions)
}
