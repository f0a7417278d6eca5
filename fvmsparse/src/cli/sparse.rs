// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::{self, File},
    io::BufWriter,
    path::{Component, Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    descriptor::{AddressDescriptor, FvmDescriptor, FvmOptions, Partition, VolumeDescriptor},
    format::{
        compression::CompressionSchema,
        sparse::{self, Header, HeaderFlags, PartitionEntry},
    },
    stream::{self, FileLen, ReadAt},
    util::{self, NumBytes},
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

/// Parsed descriptors of a sparse image.
#[derive(Clone)]
struct Metadata {
    header: Header,
    partitions: Vec<PartitionEntry>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("partitions", &CompactView(&self.partitions))
            .finish()
    }
}

/// Partition description stored in the info TOML. The data lives in a
/// separate `<name>.img` file.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct PartitionInfo {
    volume: VolumeDescriptor,
    #[serde(default)]
    address: AddressDescriptor,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ImageInfo {
    options: FvmOptions,
    #[serde(default)]
    partitions: Vec<PartitionInfo>,
}

fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

fn create_temp_writer(path: &Path) -> Result<NamedTempFile> {
    NamedTempFile::new_in(util::parent_path(path))
        .with_context(|| format!("Failed to create temporary file for: {path:?}"))
}

fn persist(temp: NamedTempFile, path: &Path) -> Result<()> {
    let temp_path = temp.path().to_owned();

    temp.persist(path).with_context(|| {
        format!("Failed to move temporary file to output path: {temp_path:?} -> {path:?}")
    })?;

    Ok(())
}

fn read_metadata(reader: &(impl ReadAt + ?Sized), path: &Path) -> Result<Metadata> {
    let header = sparse::read_header(reader, 0)
        .with_context(|| format!("Failed to read sparse header: {path:?}"))?;
    let partitions = sparse::read_partitions(reader, 0, &header)
        .with_context(|| format!("Failed to read partition descriptors: {path:?}"))?;

    Ok(Metadata { header, partitions })
}

fn display_metadata(quiet: bool, metadata: &Metadata) {
    if !quiet {
        println!("{metadata:#?}");
    }
}

/// Read image information from TOML file.
fn read_info(path: &Path) -> Result<ImageInfo> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read image info TOML: {path:?}"))?;
    let info = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse image info TOML: {path:?}"))?;

    Ok(info)
}

/// Write image information to TOML file.
fn write_info(path: &Path, info: &ImageInfo) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(info)
        .with_context(|| format!("Failed to serialize image info TOML: {path:?}"))?;
    fs::write(path, data).with_context(|| format!("Failed to write image info TOML: {path:?}"))?;

    Ok(())
}

/// Get the path to a partition's raw image inside `dir`. Names that are not a
/// single plain path component are rejected.
fn image_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let file_name = format!("{name}.img");
    let mut components = Path::new(&file_name).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if !name.is_empty() && c == file_name.as_str() => {
            Ok(dir.join(c))
        }
        _ => bail!("Unsafe partition name: {name:?}"),
    }
}

pub fn info_subcommand(cli: &InfoCli, quiet: bool) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let metadata = read_metadata(&reader, &cli.input)?;

    display_metadata(quiet, &metadata);

    let size = sparse::uncompressed_size(&metadata.header, &metadata.partitions)
        .ok_or_else(|| anyhow!("Uncompressed size overflows: {:?}", cli.input))?;
    info!("Uncompressed image size: {:?}", NumBytes(size));

    Ok(())
}

pub fn pack_subcommand(cli: &PackCli, quiet: bool) -> Result<()> {
    let info = read_info(&cli.input_info)?;

    let mut options = info.options;
    if let Some(compression) = cli.compression {
        options.compression = compression;
    }

    let partitions = info
        .partitions
        .into_iter()
        .map(|p| {
            let path = image_path(&cli.input_images, &p.volume.name)?;
            let reader = open_reader(&path)?;
            debug!("Using {path:?} for partition {:?}", p.volume.name);

            Ok(Partition {
                volume: p.volume,
                address: p.address,
                reader: Arc::new(reader),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let descriptor = FvmDescriptor {
        options,
        partitions,
    };

    let temp = create_temp_writer(&cli.output)?;
    let size = sparse::write_image(&descriptor, BufWriter::new(temp.as_file()))
        .with_context(|| format!("Failed to write sparse image: {:?}", cli.output))?;

    info!("Wrote {:?} with {options:?}", NumBytes(size));

    // Parse what was written so the metadata shown matches the output.
    let metadata = read_metadata(temp.as_file(), temp.path())?;
    display_metadata(quiet, &metadata);

    persist(temp, &cli.output)
}

pub fn unpack_subcommand(
    cli: &UnpackCli,
    quiet: bool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let metadata = read_metadata(&reader, &cli.input)?;
    display_metadata(quiet, &metadata);

    let descriptor = sparse::read_image(Arc::new(reader), 0)
        .with_context(|| format!("Failed to read sparse image: {:?}", cli.input))?;

    fs::create_dir_all(&cli.output_images)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_images))?;

    let mut partitions = Vec::with_capacity(descriptor.partitions.len());

    for partition in &descriptor.partitions {
        let path = image_path(&cli.output_images, &partition.volume.name)?;
        let temp = create_temp_writer(&path)?;
        let mut size = 0;

        for mapping in &partition.address.mappings {
            stream::copy_n_at(
                &*partition.reader,
                mapping.source,
                temp.as_file(),
                mapping.target,
                mapping.count,
                cancel_signal,
            )
            .with_context(|| {
                format!("Failed to copy data: {:?} -> {path:?}", partition.volume.name)
            })?;

            let end = mapping
                .target
                .checked_add(mapping.size.unwrap_or(mapping.count).max(mapping.count))
                .ok_or_else(|| anyhow!("Mapping end overflows: {mapping:?}"))?;
            size = size.max(end);
        }

        // Extending the file zero fills the remainder of each mapping.
        temp.as_file()
            .set_len(size)
            .with_context(|| format!("Failed to set file size: {path:?}"))?;

        info!("Extracted {path:?} ({:?})", NumBytes(temp.as_file().file_len()?));

        persist(temp, &path)?;

        // The raw image holds each mapping's data at its target offset.
        let mut address = partition.address.clone();
        for mapping in &mut address.mappings {
            mapping.source = mapping.target;
        }

        partitions.push(PartitionInfo {
            volume: partition.volume.clone(),
            address,
        });
    }

    let mut options = descriptor.options;
    if metadata.header.flags.contains(HeaderFlags::LZ4) {
        options.compression = CompressionSchema::Lz4;
    }

    write_info(
        &cli.output_info,
        &ImageInfo {
            options,
            partitions,
        },
    )
}

pub fn decompress_subcommand(cli: &DecompressCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let temp = create_temp_writer(&cli.output)?;

    let decompressed = sparse::decompress_to_file(&reader, BufWriter::new(temp.as_file()))
        .with_context(|| format!("Failed to decompress sparse image: {:?}", cli.input))?;

    if decompressed {
        info!("Decompressed {:?}", cli.input);
    } else {
        info!("Image is not compressed. Copying as is: {:?}", cli.input);

        let size = reader
            .file_len()
            .with_context(|| format!("Failed to get file size: {:?}", cli.input))?;

        stream::copy_n_at(&reader, 0, temp.as_file(), 0, size, cancel_signal)
            .with_context(|| format!("Failed to copy data: {:?} -> {:?}", cli.input, cli.output))?;
    }

    persist(temp, &cli.output)
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Pack a sparse image.
#[derive(Debug, Parser)]
pub struct PackCli {
    /// Path to output sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to input info TOML file.
    #[arg(long, value_name = "FILE", value_parser)]
    input_info: PathBuf,

    /// Directory containing the `<name>.img` raw image for each partition.
    #[arg(long, value_name = "DIR", value_parser, default_value = ".")]
    input_images: PathBuf,

    /// Compression for the extent data.
    ///
    /// This overrides the compression in the info TOML file.
    #[arg(long, value_name = "SCHEMA", value_parser)]
    compression: Option<CompressionSchema>,
}

/// Unpack a sparse image.
#[derive(Debug, Parser)]
pub struct UnpackCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output info TOML file.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: PathBuf,

    /// Directory for the `<name>.img` raw image of each partition.
    ///
    /// Each mapping's data is written at its target offset.
    #[arg(long, value_name = "DIR", value_parser)]
    output_images: PathBuf,
}

/// Decompress an LZ4 sparse image.
///
/// If the image is not compressed, it is copied unchanged.
#[derive(Debug, Parser)]
pub struct DecompressCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::atomic::AtomicBool};

    use crate::descriptor::{AddressMap, EncryptionType, PLACEHOLDER_INSTANCE_GUID};

    use super::*;

    fn mapping(source: u64, target: u64, count: u64) -> AddressMap {
        AddressMap {
            source,
            target,
            count,
            size: None,
            options: BTreeMap::new(),
        }
    }

    fn body(path: &Path) -> Vec<u8> {
        let data = fs::read(path).unwrap();
        let header = sparse::read_header(&data, 0).unwrap();

        data[header.header_length as usize..].to_vec()
    }

    #[test]
    fn unpack_then_pack_preserves_extent_data() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.img");
        let repacked = dir.path().join("repacked.img");
        let info = dir.path().join("info.toml");
        let images = dir.path().join("images");

        let data = (0..256).map(|i| ((i + 1) % 8) as u8).collect::<Vec<_>>();
        let descriptor = FvmDescriptor {
            options: FvmOptions {
                slice_size: 8192,
                max_volume_size: None,
                target_volume_size: None,
                compression: CompressionSchema::None,
            },
            partitions: vec![Partition {
                volume: VolumeDescriptor {
                    name: "system".to_owned(),
                    type_guid: [0xa1; 16],
                    instance_guid: PLACEHOLDER_INSTANCE_GUID,
                    block_size: 16,
                    encryption: EncryptionType::None,
                },
                address: AddressDescriptor {
                    mappings: vec![mapping(20, 8192, 48), mapping(180, 0, 52)],
                },
                reader: Arc::new(data),
            }],
        };

        let file = File::create(&original).unwrap();
        sparse::write_image(&descriptor, BufWriter::new(file)).unwrap();

        let cancel_signal = AtomicBool::new(false);

        unpack_subcommand(
            &UnpackCli {
                input: original.clone(),
                output_info: info.clone(),
                output_images: images.clone(),
            },
            true,
            &cancel_signal,
        )
        .unwrap();

        let saved = read_info(&info).unwrap();
        let saved_mappings = &saved.partitions[0].address.mappings;
        assert_eq!(saved_mappings[0].source, 8192);
        assert_eq!(saved_mappings[1].source, 0);

        pack_subcommand(
            &PackCli {
                output: repacked.clone(),
                input_info: info,
                input_images: images,
                compression: None,
            },
            true,
        )
        .unwrap();

        let original_body = body(&original);
        assert_eq!(&original_body[48..54], &[5, 6, 7, 0, 1, 2]);
        assert_eq!(body(&repacked), original_body);
    }

    #[test]
    fn partition_image_paths() {
        let dir = Path::new("images");

        assert_eq!(
            image_path(dir, "system").unwrap(),
            Path::new("images/system.img"),
        );
        assert!(image_path(dir, "").is_err());
        assert!(image_path(dir, "../system").is_err());
        assert!(image_path(dir, "a/b").is_err());
        assert!(image_path(dir, "/system").is_err());
    }
}
