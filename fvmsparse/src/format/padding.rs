// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a multiple of `align`.
pub fn calc<N: PrimInt>(offset: N, align: N) -> N {
    let r = offset % align;
    if r == N::zero() {
        N::zero()
    } else {
        align - r
    }
}

/// Round to the next multiple of `align`. Returns [`None`] on overflow.
pub fn round<N: PrimInt>(offset: N, align: N) -> Option<N> {
    let remain = calc(offset, align);
    offset.checked_add(&remain)
}

/// Number of `align`-sized units needed to hold `size`.
pub fn units<N: PrimInt>(size: N, align: N) -> N {
    let whole = size / align;
    if size % align == N::zero() {
        whole
    } else {
        whole + N::one()
    }
}

pub trait ZeroPadding {
    /// Trim trailing zeros. Intermediate zeros before the last non-zero byte
    /// are kept.
    fn trim_end_padding(&self) -> &[u8];

    /// Return the slice as an array padded with zeros at the end.
    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]>;
}

impl ZeroPadding for [u8] {
    fn trim_end_padding(&self) -> &[u8] {
        let first_ending_zero = self
            .iter()
            .rposition(|b| *b != 0)
            .map(|pos| pos + 1)
            .unwrap_or_default();

        &self[..first_ending_zero]
    }

    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len() > N {
            return None;
        }

        let mut result = [0u8; N];
        result[..self.len()].copy_from_slice(self);

        Some(result)
    }
}
