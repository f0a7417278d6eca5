// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader and writer for FVM sparse images.
//!
//! A sparse image is a header, a partition descriptor for each partition, each
//! followed by its extent descriptors, and finally the extent data for every
//! extent of every partition, in order. When [`HeaderFlags::LZ4`] is set, the
//! extent data is stored as a single LZ4 frame. All integers are little endian.

use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    mem,
    str::{self, FromStr},
    sync::Arc,
};

use bitflags::bitflags;
use bstr::ByteSlice;
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    descriptor::{
        AddressDescriptor, AddressMap, AddressMapOption, EncryptionType, FvmDescriptor,
        FvmOptions, PLACEHOLDER_INSTANCE_GUID, Partition, VolumeDescriptor, guid,
    },
    format::{
        ErrorKind,
        compression::{self, CompressionSchema, Decompressor, Lz4Decompressor},
        padding::{self, ZeroPadding},
    },
    stream::{CountingWriter, ReadAt, SectionReaderAt, SequentialReaderAt, UserPosFile},
    util::DebugString,
};

/// Magic value for [`RawHeader::magic`].
pub const SPARSE_MAGIC: u64 = 0x53525053204d5646;

/// Supported format version.
pub const SPARSE_VERSION: u32 = 3;

/// Magic value for [`RawPartition::magic`].
pub const PARTITION_MAGIC: u32 = 0xcf5c4c5d;

/// Magic value for [`RawExtent::magic`].
pub const EXTENT_MAGIC: u64 = 0xa5b8742906e8382e;

/// Size of the fixed-length partition name field.
pub const NAME_SIZE: usize = 24;

pub const HEADER_SIZE: u64 = mem::size_of::<RawHeader>() as u64;
pub const PARTITION_DESCRIPTOR_SIZE: u64 = mem::size_of::<RawPartition>() as u64;
pub const EXTENT_DESCRIPTOR_SIZE: u64 = mem::size_of::<RawExtent>() as u64;

/// Chunk size for streaming partition data into the compressor.
const WRITE_BUF_SIZE: usize = 16 * 1024;

/// Chunk size for streaming compressed data into the decompressor.
const DECOMPRESS_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid sparse header magic: {0:#018x}")]
    InvalidHeaderMagic(u64),
    #[error("Unsupported sparse format version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unknown sparse header flags: {0:#010x}")]
    UnknownHeaderFlags(u32),
    #[error("Slice size is zero")]
    ZeroSliceSize,
    #[error("Header length too small: {0} < {HEADER_SIZE}")]
    ShortHeaderLength(u64),
    #[error("Header length is {expected}, but descriptors span {actual} bytes")]
    HeaderLengthMismatch { expected: u64, actual: u64 },
    // Partition errors.
    #[error("Partition #{index}: Invalid magic: {magic:#010x}")]
    InvalidPartitionMagic { index: usize, magic: u32 },
    #[error("Partition #{index}: Unknown flags: {flags:#010x}")]
    UnknownPartitionFlags { index: usize, flags: u32 },
    #[error("Partition #{index}: Invalid name: {name}")]
    InvalidPartitionName { index: usize, name: DebugString },
    // Extent errors.
    #[error("Partition #{index}: Extent #{extent}: Invalid magic: {magic:#018x}")]
    InvalidExtentMagic {
        index: usize,
        extent: u64,
        magic: u64,
    },
    #[error("Partition #{index}: Extent #{extent}: Slice range overflows: {start} + {count}")]
    SliceRangeOverflow {
        index: usize,
        extent: u64,
        start: u64,
        count: u64,
    },
    #[error(
        "Partition #{index}: Extent #{extent}: Length {length} exceeds {count} slices of {slice_size} bytes"
    )]
    ExtentTooLong {
        index: usize,
        extent: u64,
        length: u64,
        count: u64,
        slice_size: u64,
    },
    #[error("Partition #{index}: Extent #{extent}: Slices {start}..{end} overlap extent #{other}")]
    OverlappingExtents {
        index: usize,
        extent: u64,
        other: u64,
        start: u64,
        end: u64,
    },
    // Writer errors.
    #[error("Partition #{index}: Mapping #{mapping}: Target range overflows")]
    MappingOverflow { index: usize, mapping: usize },
    #[error("Partition #{index}: Too many extents: {count}")]
    TooManyExtents { index: usize, count: usize },
    #[error("Image size overflows")]
    ImageSizeOverflow,
    #[error("Failed to read data for partition {name:?}")]
    PartitionRead {
        name: String,
        #[source]
        source: io::Error,
    },
    // Wrapped errors.
    #[error("Failed to process extent data")]
    Compression(#[from] compression::Error),
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHeaderMagic(_)
            | Self::InvalidPartitionMagic { .. }
            | Self::InvalidExtentMagic { .. } => ErrorKind::BadMagic,
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Self::UnknownHeaderFlags(_) | Self::UnknownPartitionFlags { .. } => {
                ErrorKind::UnknownFlag
            }
            Self::ZeroSliceSize => ErrorKind::ZeroSliceSize,
            Self::ShortHeaderLength(_) => ErrorKind::ShortHeader,
            Self::SliceRangeOverflow { .. } | Self::ExtentTooLong { .. } => {
                ErrorKind::ExtentGeometry
            }
            Self::OverlappingExtents { .. } => ErrorKind::OverlappingExtents,
            Self::Compression(e) => e.kind(),
            Self::PartitionRead { .. } | Self::DataRead(_, _) | Self::DataWrite(_, _) => {
                ErrorKind::IoError
            }
            Self::HeaderLengthMismatch { .. }
            | Self::InvalidPartitionName { .. }
            | Self::MappingOverflow { .. }
            | Self::TooManyExtents { .. }
            | Self::ImageSizeOverflow => ErrorKind::InvalidData,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Sink failures are failures of the output writer.
fn map_codec_error(e: compression::Error) -> Error {
    match e {
        compression::Error::Sink(e) => Error::DataWrite("extent_data", e),
        e => Error::Compression(e),
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct HeaderFlags: u32 {
        /// The extent data is stored as a single LZ4 frame.
        const LZ4 = 1 << 0;
        /// Readers do not need to zero fill the part of each extent's slices
        /// beyond the stored extent data.
        const ZERO_FILL_NOT_REQUIRED = 1 << 2;

        const _ = !0;
    }
}

impl HeaderFlags {
    pub const MASK: Self = Self::LZ4.union(Self::ZERO_FILL_NOT_REQUIRED);
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct PartitionFlags: u32 {
        const ZXCRYPT = 1 << 0;
        const ZERO_FILL_NOT_REQUIRED = 1 << 1;

        const _ = !0;
    }
}

impl PartitionFlags {
    pub const MASK: Self = Self::ZXCRYPT.union(Self::ZERO_FILL_NOT_REQUIRED);
}

/// A potentially invalid null-padded partition name.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct PartitionName([u8; NAME_SIZE]);

impl fmt::Debug for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.split().0.as_bstr(), f)
    }
}

impl PartitionName {
    fn split(&self) -> (&[u8], &[u8]) {
        memchr::memchr(0, &self.0).map_or((&self.0, &[]), |i| self.0.split_at(i))
    }

    /// Bytes after the first NUL are ignored.
    fn as_str(&self) -> Option<&str> {
        str::from_utf8(self.split().0).ok()
    }
}

impl FromStr for PartitionName {
    type Err = DebugString;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.as_bytes().contains(&0) {
            return Err(DebugString::new(s));
        }

        let name = s
            .as_bytes()
            .to_padded_array()
            .ok_or_else(|| DebugString::new(s))?;

        Ok(Self(name))
    }
}

/// Raw on-disk layout for the sparse image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SPARSE_MAGIC`].
    magic: little_endian::U64,
    /// Format version. This should be equal to [`SPARSE_VERSION`].
    version: little_endian::U32,
    /// Bit flags from [`HeaderFlags`].
    flags: little_endian::U32,
    /// Size of the header and all descriptors. The extent data starts here.
    header_length: little_endian::U64,
    /// Size of each slice in bytes.
    slice_size: little_endian::U64,
    /// Number of partition descriptors.
    partition_count: little_endian::U64,
    /// Maximum size the volume may grow to. Zero if unbounded.
    maximum_disk_size: little_endian::U64,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#018x}", self.magic.get()))
            .field("version", &self.version.get())
            .field("flags", &format_args!("{:#010x}", self.flags.get()))
            .field("header_length", &self.header_length.get())
            .field("slice_size", &self.slice_size.get())
            .field("partition_count", &self.partition_count.get())
            .field("maximum_disk_size", &self.maximum_disk_size.get())
            .finish()
    }
}

impl RawHeader {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks.
    fn validate(&self) -> Result<()> {
        if self.magic.get() != SPARSE_MAGIC {
            return Err(Error::InvalidHeaderMagic(self.magic.get()));
        }

        if self.version.get() != SPARSE_VERSION {
            return Err(Error::UnsupportedVersion(self.version.get()));
        }

        let flags = HeaderFlags::from_bits_retain(self.flags.get());
        if !(flags - HeaderFlags::MASK).is_empty() {
            return Err(Error::UnknownHeaderFlags(flags.bits()));
        }

        if self.slice_size.get() == 0 {
            return Err(Error::ZeroSliceSize);
        }

        if self.header_length.get() < HEADER_SIZE {
            return Err(Error::ShortHeaderLength(self.header_length.get()));
        }

        // Every partition needs at least a partition descriptor, so a count
        // that cannot fit is rejected before anything is allocated for it.
        let min_length = self
            .partition_count
            .get()
            .checked_mul(PARTITION_DESCRIPTOR_SIZE)
            .and_then(|s| s.checked_add(HEADER_SIZE));
        if min_length.is_none_or(|l| l > self.header_length.get()) {
            return Err(Error::HeaderLengthMismatch {
                expected: self.header_length.get(),
                actual: min_length.unwrap_or(u64::MAX),
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for a partition descriptor.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartition {
    /// Magic value. This should be equal to [`PARTITION_MAGIC`].
    magic: little_endian::U32,
    type_guid: [u8; 16],
    name: PartitionName,
    /// Bit flags from [`PartitionFlags`].
    flags: little_endian::U32,
    /// Number of [`RawExtent`] entries immediately following this descriptor.
    extent_count: little_endian::U32,
}

impl fmt::Debug for RawPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPartition")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("type_guid", &guid::to_string(&self.type_guid))
            .field("name", &self.name)
            .field("flags", &format_args!("{:#010x}", self.flags.get()))
            .field("extent_count", &self.extent_count.get())
            .finish()
    }
}

impl RawPartition {
    fn validate(&self, index: usize) -> Result<()> {
        if self.magic.get() != PARTITION_MAGIC {
            return Err(Error::InvalidPartitionMagic {
                index,
                magic: self.magic.get(),
            });
        }

        let flags = PartitionFlags::from_bits_retain(self.flags.get());
        if !(flags - PartitionFlags::MASK).is_empty() {
            return Err(Error::UnknownPartitionFlags {
                index,
                flags: flags.bits(),
            });
        }

        if self.name.as_str().is_none() {
            return Err(Error::InvalidPartitionName {
                index,
                name: DebugString::new(self.name),
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for an extent descriptor.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    /// Magic value. This should be equal to [`EXTENT_MAGIC`].
    magic: little_endian::U64,
    /// First virtual slice covered by this extent.
    slice_start: little_endian::U64,
    /// Number of slices covered by this extent.
    slice_count: little_endian::U64,
    /// Number of bytes of extent data stored in the image.
    extent_length: little_endian::U64,
}

impl fmt::Debug for RawExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawExtent")
            .field("magic", &format_args!("{:#018x}", self.magic.get()))
            .field("slice_start", &self.slice_start.get())
            .field("slice_count", &self.slice_count.get())
            .field("extent_length", &self.extent_length.get())
            .finish()
    }
}

impl RawExtent {
    fn validate(&self, index: usize, extent: u64, slice_size: u64) -> Result<()> {
        if self.magic.get() != EXTENT_MAGIC {
            return Err(Error::InvalidExtentMagic {
                index,
                extent,
                magic: self.magic.get(),
            });
        }

        let start = self.slice_start.get();
        let count = self.slice_count.get();

        // The byte offsets of the slice range must be representable too.
        if start
            .checked_add(count)
            .and_then(|end| end.checked_mul(slice_size))
            .is_none()
        {
            return Err(Error::SliceRangeOverflow {
                index,
                extent,
                start,
                count,
            });
        }

        let length = self.extent_length.get();
        if length > count * slice_size {
            return Err(Error::ExtentTooLong {
                index,
                extent,
                length,
                count,
                slice_size,
            });
        }

        Ok(())
    }
}

/// Parsed sparse image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub flags: HeaderFlags,
    /// Offset of the extent data.
    pub header_length: u64,
    pub slice_size: u64,
    pub partition_count: u64,
    /// [`None`] if the on-disk value was zero.
    pub maximum_disk_size: Option<u64>,
}

impl Header {
    /// Compute the header describing the sparse image for `descriptor`.
    pub fn from_descriptor(descriptor: &FvmDescriptor) -> Result<Self> {
        let mut flags = HeaderFlags::empty();
        if descriptor.options.compression == CompressionSchema::Lz4 {
            flags |= HeaderFlags::LZ4;
        }

        let mut header_length = HEADER_SIZE;
        for partition in &descriptor.partitions {
            let size = (partition.address.mappings.len() as u64)
                .checked_mul(EXTENT_DESCRIPTOR_SIZE)
                .and_then(|s| s.checked_add(PARTITION_DESCRIPTOR_SIZE))
                .ok_or(Error::ImageSizeOverflow)?;

            header_length = header_length
                .checked_add(size)
                .ok_or(Error::ImageSizeOverflow)?;
        }

        Ok(Self {
            flags,
            header_length,
            slice_size: descriptor.options.slice_size,
            partition_count: descriptor.partitions.len() as u64,
            maximum_disk_size: descriptor.options.max_volume_size,
        })
    }

    fn from_raw(raw: &RawHeader) -> Self {
        Self {
            flags: HeaderFlags::from_bits_retain(raw.flags.get()),
            header_length: raw.header_length.get(),
            slice_size: raw.slice_size.get(),
            partition_count: raw.partition_count.get(),
            maximum_disk_size: Some(raw.maximum_disk_size.get()).filter(|s| *s > 0),
        }
    }

    fn to_raw(self) -> RawHeader {
        RawHeader {
            magic: SPARSE_MAGIC.into(),
            version: SPARSE_VERSION.into(),
            flags: self.flags.bits().into(),
            header_length: self.header_length.into(),
            slice_size: self.slice_size.into(),
            partition_count: self.partition_count.into(),
            maximum_disk_size: self.maximum_disk_size.unwrap_or(0).into(),
        }
    }
}

/// Parsed extent descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub slice_start: u64,
    pub slice_count: u64,
    /// Number of bytes of data stored in the image for this extent.
    pub extent_length: u64,
}

impl ExtentDescriptor {
    fn from_raw(raw: &RawExtent) -> Self {
        Self {
            slice_start: raw.slice_start.get(),
            slice_count: raw.slice_count.get(),
            extent_length: raw.extent_length.get(),
        }
    }

    fn to_raw(self) -> RawExtent {
        RawExtent {
            magic: EXTENT_MAGIC.into(),
            slice_start: self.slice_start.into(),
            slice_count: self.slice_count.into(),
            extent_length: self.extent_length.into(),
        }
    }

    fn slice_end(&self) -> u64 {
        self.slice_start + self.slice_count
    }
}

/// Parsed partition descriptor and its extents.
#[derive(Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub name: String,
    pub flags: PartitionFlags,
    pub extents: Vec<ExtentDescriptor>,
}

impl fmt::Debug for PartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionEntry")
            .field("type_guid", &guid::to_string(&self.type_guid))
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("extents", &self.extents)
            .finish()
    }
}

impl PartitionEntry {
    /// Compute the partition descriptor and extents for `partition`, which is
    /// the `index`th partition of an image with the given slice size.
    pub fn from_partition(partition: &Partition, index: usize, slice_size: u64) -> Result<Self> {
        if slice_size == 0 {
            return Err(Error::ZeroSliceSize);
        }

        let volume = &partition.volume;
        let mappings = &partition.address.mappings;

        // Validate the name here so that writing cannot fail halfway through.
        PartitionName::from_str(&volume.name)
            .map_err(|name| Error::InvalidPartitionName { index, name })?;

        if u32::try_from(mappings.len()).is_err() {
            return Err(Error::TooManyExtents {
                index,
                count: mappings.len(),
            });
        }

        let mut flags = PartitionFlags::empty();
        if volume.encryption == EncryptionType::Zxcrypt {
            flags |= PartitionFlags::ZXCRYPT;
        }
        if !mappings
            .iter()
            .any(|m| m.options.contains_key(&AddressMapOption::Fill))
        {
            flags |= PartitionFlags::ZERO_FILL_NOT_REQUIRED;
        }

        let extents = mappings
            .iter()
            .enumerate()
            .map(|(i, mapping)| {
                let length = mapping.count.max(mapping.size.unwrap_or(0));
                let end = (mapping.target % slice_size)
                    .checked_add(length)
                    .ok_or(Error::MappingOverflow { index, mapping: i })?;

                Ok(ExtentDescriptor {
                    slice_start: mapping.target / slice_size,
                    slice_count: padding::units(end, slice_size),
                    extent_length: mapping.count,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            type_guid: volume.type_guid,
            name: volume.name.clone(),
            flags,
            extents,
        })
    }

    fn to_raw(&self, index: usize) -> Result<RawPartition> {
        let name = PartitionName::from_str(&self.name)
            .map_err(|name| Error::InvalidPartitionName { index, name })?;
        let extent_count =
            u32::try_from(self.extents.len()).map_err(|_| Error::TooManyExtents {
                index,
                count: self.extents.len(),
            })?;

        Ok(RawPartition {
            magic: PARTITION_MAGIC.into(),
            type_guid: self.type_guid,
            name,
            flags: self.flags.bits().into(),
            extent_count: extent_count.into(),
        })
    }

    /// Total number of bytes of extent data for this partition.
    pub fn data_size(&self) -> Option<u64> {
        self.extents
            .iter()
            .try_fold(0u64, |acc, e| acc.checked_add(e.extent_length))
    }
}

/// Tracks the slice ranges claimed by the extents of one partition.
#[derive(Debug, Default)]
struct SliceRanges(BTreeMap<u64, (u64, u64)>);

impl SliceRanges {
    /// Claim `start..end` for `extent`. If the range intersects an already
    /// claimed range, the extent that owns it is returned instead.
    fn claim(&mut self, start: u64, end: u64, extent: u64) -> std::result::Result<(), u64> {
        if start == end {
            return Ok(());
        }

        // Ranges that were inserted are disjoint, so only the last range that
        // starts before `end` can reach into `start..end`.
        if let Some((_, (other_end, other))) = self.0.range(..end).next_back() {
            if *other_end > start {
                return Err(*other);
            }
        }

        self.0.insert(start, (end, extent));

        Ok(())
    }
}

/// Sequential reader for the descriptors in `[offset, offset + header_length)`.
struct DescriptorCursor<'a, R: ?Sized> {
    reader: &'a R,
    offset: u64,
    pos: u64,
    header_length: u64,
}

impl<R: ReadAt + ?Sized> DescriptorCursor<'_, R> {
    fn read<T: FromBytes + IntoBytes>(&mut self, name: &'static str) -> Result<T> {
        let size = mem::size_of::<T>() as u64;
        let end = self.pos + size;

        if end > self.header_length {
            return Err(Error::HeaderLengthMismatch {
                expected: self.header_length,
                actual: end,
            });
        }

        let mut raw = T::new_zeroed();
        self.reader
            .read_exact_at(raw.as_mut_bytes(), self.offset + self.pos)
            .map_err(|e| Error::DataRead(name, e))?;
        self.pos = end;

        Ok(raw)
    }
}

/// Read and validate the sparse image header at `offset`.
pub fn read_header(reader: &(impl ReadAt + ?Sized), offset: u64) -> Result<Header> {
    let mut raw = RawHeader::new_zeroed();
    reader
        .read_exact_at(raw.as_mut_bytes(), offset)
        .map_err(|e| Error::DataRead("header", e))?;

    trace!("Read sparse header: {raw:?}");

    raw.validate()?;

    offset
        .checked_add(raw.header_length.get())
        .ok_or(Error::ImageSizeOverflow)?;

    Ok(Header::from_raw(&raw))
}

/// Read and validate the partition and extent descriptors of the image at
/// `offset`. The descriptors must exactly fill the header length.
pub fn read_partitions(
    reader: &(impl ReadAt + ?Sized),
    offset: u64,
    header: &Header,
) -> Result<Vec<PartitionEntry>> {
    let mut cursor = DescriptorCursor {
        reader,
        offset,
        pos: HEADER_SIZE,
        header_length: header.header_length,
    };
    // Bounded by the header length check in RawHeader::validate().
    let mut partitions = Vec::with_capacity(header.partition_count as usize);

    for index in 0..header.partition_count as usize {
        let raw: RawPartition = cursor.read("partition")?;
        trace!("Read partition #{index}: {raw:?}");
        raw.validate(index)?;

        let mut extents = vec![];
        let mut ranges = SliceRanges::default();

        for extent in 0..u64::from(raw.extent_count.get()) {
            let raw_extent: RawExtent = cursor.read("extent")?;
            raw_extent.validate(index, extent, header.slice_size)?;

            let descriptor = ExtentDescriptor::from_raw(&raw_extent);
            let (start, end) = (descriptor.slice_start, descriptor.slice_end());

            ranges
                .claim(start, end, extent)
                .map_err(|other| Error::OverlappingExtents {
                    index,
                    extent,
                    other,
                    start,
                    end,
                })?;

            extents.push(descriptor);
        }

        partitions.push(PartitionEntry {
            type_guid: raw.type_guid,
            // Already validated.
            name: raw.name.as_str().unwrap_or_default().to_owned(),
            flags: PartitionFlags::from_bits_retain(raw.flags.get()),
            extents,
        });
    }

    if cursor.pos != header.header_length {
        return Err(Error::HeaderLengthMismatch {
            expected: header.header_length,
            actual: cursor.pos,
        });
    }

    Ok(partitions)
}

/// Size of the image after decompression: the header and descriptors plus the
/// data of every extent.
pub fn uncompressed_size(header: &Header, partitions: &[PartitionEntry]) -> Option<u64> {
    partitions.iter().try_fold(header.header_length, |acc, p| {
        p.data_size().and_then(|s| acc.checked_add(s))
    })
}

/// Write the sparse image for `descriptor` to `writer`. The extent data is
/// compressed according to the descriptor's compression schema. Returns the
/// number of bytes written.
pub fn write_image(descriptor: &FvmDescriptor, writer: impl Write) -> Result<u64> {
    let header = Header::from_descriptor(descriptor)?;
    let raw_header = header.to_raw();
    raw_header.validate()?;

    let entries = descriptor
        .partitions
        .iter()
        .enumerate()
        .map(|(i, p)| PartitionEntry::from_partition(p, i, header.slice_size))
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "Writing sparse image with {} partitions and {} byte header",
        entries.len(),
        header.header_length,
    );

    let mut writer = CountingWriter::new(writer);

    raw_header
        .write_to_io(&mut writer)
        .map_err(|e| Error::DataWrite("header", e))?;

    for (index, entry) in entries.iter().enumerate() {
        entry
            .to_raw(index)?
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("partition", e))?;

        for extent in &entry.extents {
            extent
                .to_raw()
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("extent", e))?;
        }
    }

    if writer.count() != header.header_length {
        return Err(Error::HeaderLengthMismatch {
            expected: header.header_length,
            actual: writer.count(),
        });
    }

    {
        let mut compressor = descriptor.options.compression.compressor();
        compressor
            .prepare(Box::new(|data| writer.write_all(data)))
            .map_err(map_codec_error)?;

        let mut buf = vec![0u8; WRITE_BUF_SIZE];

        for (partition, entry) in descriptor.partitions.iter().zip(&entries) {
            debug!(
                "Writing {:?} bytes of data for partition {:?}",
                entry.data_size(),
                entry.name,
            );

            for mapping in &partition.address.mappings {
                let mut copied = 0;

                while copied < mapping.count {
                    let n = (mapping.count - copied).min(buf.len() as u64) as usize;
                    let offset = mapping.source.checked_add(copied).ok_or_else(|| {
                        Error::PartitionRead {
                            name: entry.name.clone(),
                            source: io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "Source offset overflows",
                            ),
                        }
                    })?;

                    partition
                        .reader
                        .read_exact_at(&mut buf[..n], offset)
                        .map_err(|source| Error::PartitionRead {
                            name: entry.name.clone(),
                            source,
                        })?;

                    compressor.compress(&buf[..n]).map_err(map_codec_error)?;
                    copied += n as u64;
                }
            }
        }

        compressor.finalize().map_err(map_codec_error)?;
    }

    writer
        .flush()
        .map_err(|e| Error::DataWrite("extent_data", e))?;

    Ok(writer.count())
}

/// Open a reader for the decompressed extent data of an LZ4 image.
fn lz4_data_reader(
    reader: Arc<dyn ReadAt>,
    offset: u64,
    size: u64,
) -> Result<SequentialReaderAt<FrameDecoder<UserPosFile<SectionReaderAt<Arc<dyn ReadAt>>>>>> {
    let file_len = reader
        .file_len()
        .map_err(|e| Error::DataRead("file_len", e))?;
    let compressed_size = file_len.saturating_sub(offset);

    let open = move || -> io::Result<_> {
        let section = SectionReaderAt::new(reader.clone(), offset, compressed_size)?;
        Ok(FrameDecoder::new(UserPosFile::new(section, 0)))
    };

    SequentialReaderAt::new(Box::new(open), size).map_err(|e| Error::DataRead("lz4_frame", e))
}

/// Parse the sparse image at `offset` into a descriptor. Each partition's
/// reader exposes that partition's extent data, back to back, in extent order,
/// so that the mappings' `source` offsets index into it.
pub fn read_image(reader: Arc<dyn ReadAt>, offset: u64) -> Result<FvmDescriptor> {
    let header = read_header(&*reader, offset)?;
    let entries = read_partitions(&*reader, offset, &header)?;

    debug!("Read sparse header: {header:?}");

    let data_offset = offset + header.header_length;
    let data_size = uncompressed_size(&header, &entries)
        .ok_or(Error::ImageSizeOverflow)?
        - header.header_length;

    let data: Arc<dyn ReadAt> = if header.flags.contains(HeaderFlags::LZ4) {
        Arc::new(lz4_data_reader(reader, data_offset, data_size)?)
    } else {
        Arc::new(
            SectionReaderAt::new(reader, data_offset, data_size)
                .map_err(|e| Error::DataRead("extent_data", e))?,
        )
    };

    let slice_size = header.slice_size;
    let fill = !header.flags.contains(HeaderFlags::ZERO_FILL_NOT_REQUIRED);
    let mut partitions = Vec::with_capacity(entries.len());
    let mut partition_offset = 0u64;

    for entry in entries {
        let mut mappings = Vec::with_capacity(entry.extents.len());
        let mut source = 0u64;

        for extent in &entry.extents {
            let mut options = BTreeMap::new();
            if fill {
                options.insert(AddressMapOption::Fill, 0);
            }

            // Products cannot overflow after RawExtent::validate().
            mappings.push(AddressMap {
                source,
                target: extent.slice_start * slice_size,
                count: extent.extent_length,
                size: Some(extent.slice_count * slice_size),
                options,
            });

            source += extent.extent_length;
        }

        let partition_reader = SectionReaderAt::new(data.clone(), partition_offset, source)
            .map_err(|e| Error::DataRead("extent_data", e))?;
        partition_offset += source;

        let encryption = if entry.flags.contains(PartitionFlags::ZXCRYPT) {
            EncryptionType::Zxcrypt
        } else {
            EncryptionType::None
        };

        partitions.push(Partition {
            volume: VolumeDescriptor {
                name: entry.name,
                type_guid: entry.type_guid,
                instance_guid: PLACEHOLDER_INSTANCE_GUID,
                block_size: slice_size,
                encryption,
            },
            address: AddressDescriptor { mappings },
            reader: Arc::new(partition_reader),
        });
    }

    Ok(FvmDescriptor {
        options: FvmOptions {
            slice_size,
            max_volume_size: header.maximum_disk_size,
            target_volume_size: None,
            compression: CompressionSchema::None,
        },
        partitions,
    })
}

/// Write an uncompressed copy of the LZ4 sparse image from `reader` to
/// `writer`. Returns `false`, without writing anything, if the image is not
/// compressed.
pub fn decompress_to_file(reader: &(impl ReadAt + ?Sized), mut writer: impl Write) -> Result<bool> {
    let header = read_header(reader, 0)?;
    // Only validation is needed. The descriptors are copied verbatim.
    read_partitions(reader, 0, &header)?;

    if !header.flags.contains(HeaderFlags::LZ4) {
        return Ok(false);
    }

    let mut out_header = header;
    out_header.flags =
        (header.flags - HeaderFlags::LZ4) | HeaderFlags::ZERO_FILL_NOT_REQUIRED;

    out_header
        .to_raw()
        .write_to_io(&mut writer)
        .map_err(|e| Error::DataWrite("header", e))?;

    let mut buf = vec![0u8; DECOMPRESS_BUF_SIZE];
    let mut pos = HEADER_SIZE;

    while pos < header.header_length {
        let n = (header.header_length - pos).min(buf.len() as u64) as usize;

        reader
            .read_exact_at(&mut buf[..n], pos)
            .map_err(|e| Error::DataRead("descriptors", e))?;
        writer
            .write_all(&buf[..n])
            .map_err(|e| Error::DataWrite("descriptors", e))?;

        pos += n as u64;
    }

    let file_len = reader
        .file_len()
        .map_err(|e| Error::DataRead("file_len", e))?;

    {
        let mut decompressor = Lz4Decompressor::new();
        decompressor
            .prepare(Box::new(|data| writer.write_all(data)))
            .map_err(map_codec_error)?;

        while pos < file_len {
            let n = (file_len - pos).min(buf.len() as u64) as usize;

            reader
                .read_exact_at(&mut buf[..n], pos)
                .map_err(|e| Error::DataRead("compressed_data", e))?;
            pos += n as u64;

            if decompressor
                .decompress(&buf[..n])
                .map_err(map_codec_error)?
                .finished
            {
                break;
            }
        }

        decompressor.finalize().map_err(map_codec_error)?;
    }

    writer
        .flush()
        .map_err(|e| Error::DataWrite("extent_data", e))?;

    debug!("Decompressed {pos} bytes of sparse image");

    Ok(true)
}
