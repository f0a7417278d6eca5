/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Reader and writer for FVM sparse images, plus derivation of the on-disk FVM
//! metadata for them.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod descriptor;
pub mod format;
pub mod stream;
pub mod util;
