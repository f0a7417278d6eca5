// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory description of an FVM image: the partitions, how their data is
//! laid out in the volume, and where the data comes from.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{format::compression::CompressionSchema, stream::ReadAt};

/// Instance GUID assigned to partitions whose real instance GUID is not known,
/// such as when they are read back from a sparse image.
pub const PLACEHOLDER_INSTANCE_GUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    #[default]
    None,
    Zxcrypt,
}

/// Per-mapping options. These are used as map keys, so they are serialized as
/// plain strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum AddressMapOption {
    /// The part of the mapping's target range beyond `count` must be filled
    /// with this value (zero-filled in practice).
    Fill,
}

impl AddressMapOption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fill => "fill",
        }
    }
}

impl From<AddressMapOption> for &'static str {
    fn from(value: AddressMapOption) -> Self {
        value.as_str()
    }
}

impl TryFrom<String> for AddressMapOption {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "fill" => Ok(Self::Fill),
            _ => Err(format!("Unknown address map option: {value:?}")),
        }
    }
}

/// Maps a range of the partition's backing data to the partition's address
/// space.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressMap {
    /// Offset in the partition's reader.
    pub source: u64,
    /// Offset in the partition's address space.
    pub target: u64,
    /// Number of bytes to copy from the reader.
    pub count: u64,
    /// Size of the target range, if larger than `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<AddressMapOption, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressDescriptor {
    #[serde(default)]
    pub mappings: Vec<AddressMap>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeDescriptor {
    pub name: String,
    #[serde(with = "guid")]
    pub type_guid: [u8; 16],
    #[serde(with = "guid")]
    pub instance_guid: [u8; 16],
    pub block_size: u64,
    #[serde(default)]
    pub encryption: EncryptionType,
}

/// A partition along with the reader for its backing data.
#[derive(Clone)]
pub struct Partition {
    pub volume: VolumeDescriptor,
    pub address: AddressDescriptor,
    pub reader: Arc<dyn ReadAt>,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("volume", &self.volume)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FvmOptions {
    /// Size of a slice in bytes.
    pub slice_size: u64,
    /// Size the volume is allowed to grow to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volume_size: Option<u64>,
    /// Size of the volume when it is materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_volume_size: Option<u64>,
    #[serde(default)]
    pub compression: CompressionSchema,
}

#[derive(Clone, Debug)]
pub struct FvmDescriptor {
    pub options: FvmOptions,
    pub partitions: Vec<Partition>,
}

/// GUIDs in the mixed-endian textual form, where the first three groups are
/// stored little-endian. For example, the bytes `01 02 03 04 05 06 07 08 09 10
/// ...` are written as `04030201-0605-0807-0910-...`.
pub mod guid {
    use std::fmt::Write;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Byte order of the textual groups relative to the raw bytes.
    const ORDER: [usize; 16] = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];

    pub fn to_string(guid: &[u8; 16]) -> String {
        let mut result = String::with_capacity(36);

        for (i, index) in ORDER.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                result.push('-');
            }

            // Writing to a String cannot fail.
            let _ = write!(result, "{:02X}", guid[*index]);
        }

        result
    }

    pub fn parse(s: &str) -> Option<[u8; 16]> {
        let bytes = s.as_bytes();
        if bytes.len() != 36 || [8, 13, 18, 23].iter().any(|i| bytes[*i] != b'-') {
            return None;
        }

        let digits = s.split('-').collect::<String>();
        let raw = hex::decode(digits).ok()?;
        if raw.len() != ORDER.len() {
            return None;
        }

        let mut guid = [0u8; 16];
        for (i, index) in ORDER.iter().enumerate() {
            guid[*index] = raw[i];
        }

        Some(guid)
    }

    pub fn serialize<S: Serializer>(guid: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_string(guid))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(deserializer)?;

        parse(&s).ok_or_else(|| D::Error::custom(format!("Invalid GUID: {s:?}")))
    }
}
