// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use tempfile::NamedTempFile;
use tracing::info;

use crate::{
    descriptor::FvmOptions,
    format::{compression::CompressionSchema, fvm, sparse},
    stream::ToWriter,
    util::{self, NumBytes},
};

pub fn fvm_main(cli: &FvmCli, quiet: bool) -> Result<()> {
    let reader = File::open(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let header = sparse::read_header(&reader, 0)
        .with_context(|| format!("Failed to read sparse header: {:?}", cli.input))?;
    let partitions = sparse::read_partitions(&reader, 0, &header)
        .with_context(|| format!("Failed to read partition descriptors: {:?}", cli.input))?;

    let options = FvmOptions {
        slice_size: header.slice_size,
        max_volume_size: cli.max_volume_size,
        target_volume_size: cli.target_volume_size,
        compression: CompressionSchema::None,
    };

    let metadata = fvm::derive_layout(&header, &partitions, cli.minimum_slice_count, &options)
        .with_context(|| format!("Failed to derive FVM layout: {:?}", cli.input))?;

    if !quiet {
        println!("{metadata:#?}");
    }

    info!(
        "Allocated {} of {} slices in {:?} volume",
        metadata.allocated_slice_count(),
        metadata.header.pslice_count,
        NumBytes(metadata.header.fvm_partition_size),
    );

    let temp = NamedTempFile::new_in(util::parent_path(&cli.output))
        .with_context(|| format!("Failed to create temporary file for: {:?}", cli.output))?;
    let mut writer = BufWriter::new(temp.as_file());

    metadata
        .to_writer(&mut writer)
        .with_context(|| format!("Failed to write FVM metadata: {:?}", cli.output))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush FVM metadata: {:?}", cli.output))?;
    drop(writer);

    let temp_path = temp.path().to_owned();
    temp.persist(&cli.output).with_context(|| {
        format!(
            "Failed to move temporary file to output path: {temp_path:?} -> {:?}",
            cli.output,
        )
    })?;

    Ok(())
}

/// Derive the FVM metadata for a sparse image.
///
/// The output contains the primary and secondary copies of the metadata,
/// which belong at the start of the volume.
#[derive(Debug, Parser)]
pub struct FvmCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output FVM metadata.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Minimum number of slices the volume must hold.
    ///
    /// The slices used by the partitions are always included.
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    minimum_slice_count: u64,

    /// Size the volume may grow to.
    ///
    /// Defaults to the maximum disk size in the sparse image header, if any.
    #[arg(long, value_name = "BYTES")]
    max_volume_size: Option<u64>,

    /// Size of the volume.
    #[arg(long, value_name = "BYTES")]
    target_volume_size: Option<u64>,
}
