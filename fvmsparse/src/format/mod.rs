/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt;

pub mod compression;
pub mod fvm;
pub mod padding;
pub mod sparse;

/// Coarse classification of the errors returned by the format modules. Each
/// module's `Error::kind()` maps its variants onto one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    IoError,
    BadMagic,
    UnsupportedVersion,
    UnknownFlag,
    ZeroSliceSize,
    ShortHeader,
    ExtentGeometry,
    OverlappingExtents,
    CompressionError,
    VolumeTooSmall,
    StateError,
    /// Structurally invalid values not covered by the other kinds.
    InvalidData,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IoError => "I/O error",
            Self::BadMagic => "bad magic",
            Self::UnsupportedVersion => "unsupported version",
            Self::UnknownFlag => "unknown flag",
            Self::ZeroSliceSize => "zero slice size",
            Self::ShortHeader => "short header",
            Self::ExtentGeometry => "invalid extent geometry",
            Self::OverlappingExtents => "overlapping extents",
            Self::CompressionError => "compression error",
            Self::VolumeTooSmall => "volume too small",
            Self::StateError => "invalid state",
            Self::InvalidData => "invalid data",
        })
    }
}
