// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, io::Cursor, sync::Arc};

use assert_matches::assert_matches;
use fvmsparse::{
    descriptor::{
        AddressDescriptor, AddressMap, AddressMapOption, EncryptionType, FvmDescriptor,
        FvmOptions, PLACEHOLDER_INSTANCE_GUID, Partition, VolumeDescriptor,
    },
    format::{
        ErrorKind,
        compression::{CompressionSchema, Decompressor, Lz4Decompressor},
        sparse::{
            self, EXTENT_DESCRIPTOR_SIZE, Error, HEADER_SIZE, HeaderFlags,
            PARTITION_DESCRIPTOR_SIZE, PartitionFlags,
        },
    },
    stream::{FileLen, ReadAt},
};

const SLICE_SIZE: u64 = 8192;
const MAX_VOLUME_SIZE: u64 = 20 * 1024 * 1024;

const TYPE_GUID_1: [u8; 16] = [
    0xa1, 0xa2, 0xa3, 0xa4, 0xb5, 0xb6, 0xc7, 0xc8, 0xd0, 0xd1, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5,
];
const TYPE_GUID_2: [u8; 16] = [
    0xa1, 0xa2, 0xa3, 0xa4, 0xb5, 0xb6, 0xc7, 0xc8, 0xd0, 0xd1, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe6,
];

/// Offsets into the uncompressed two-partition image.
const PARTITION_1_OFFSET: usize = HEADER_SIZE as usize;
const PARTITION_1_EXTENTS_OFFSET: usize = PARTITION_1_OFFSET + 52;
const HEADER_LENGTH: u64 = 312;

fn mapping(source: u64, target: u64, count: u64) -> AddressMap {
    AddressMap {
        source,
        target,
        count,
        size: None,
        options: BTreeMap::new(),
    }
}

/// Backing data where the byte at offset `i` is `(i + bias) % 8`.
fn pattern(size: usize, bias: usize) -> Vec<u8> {
    (0..size).map(|i| ((i + bias) % 8) as u8).collect()
}

fn partition(
    name: &str,
    type_guid: [u8; 16],
    block_size: u64,
    mappings: Vec<AddressMap>,
    data: Vec<u8>,
) -> Partition {
    Partition {
        volume: VolumeDescriptor {
            name: name.to_owned(),
            type_guid,
            instance_guid: PLACEHOLDER_INSTANCE_GUID,
            block_size,
            encryption: EncryptionType::Zxcrypt,
        },
        address: AddressDescriptor { mappings },
        reader: Arc::new(data),
    }
}

fn two_partition_descriptor(compression: CompressionSchema) -> FvmDescriptor {
    FvmDescriptor {
        options: FvmOptions {
            slice_size: SLICE_SIZE,
            max_volume_size: Some(MAX_VOLUME_SIZE),
            target_volume_size: None,
            compression,
        },
        partitions: vec![
            partition(
                "partition-1",
                TYPE_GUID_1,
                16,
                vec![
                    mapping(20, 8192, 48),
                    mapping(180, 0, 52),
                    mapping(190, 16384, 20),
                ],
                pattern(256, 1),
            ),
            partition(
                "partition-2",
                TYPE_GUID_2,
                32,
                vec![mapping(25, 0, 30), mapping(250, 327680, 61)],
                pattern(320, 2),
            ),
        ],
    }
}

fn encode(descriptor: &FvmDescriptor) -> Vec<u8> {
    let mut writer = Cursor::new(Vec::new());
    let size = sparse::write_image(descriptor, &mut writer).unwrap();
    let data = writer.into_inner();
    assert_eq!(size, data.len() as u64);

    data
}

/// Concatenated source bytes of every mapping of every partition.
fn expected_body(descriptor: &FvmDescriptor) -> Vec<u8> {
    let mut body = vec![];

    for partition in &descriptor.partitions {
        for m in &partition.address.mappings {
            let mut buf = vec![0u8; m.count as usize];
            partition.reader.read_exact_at(&mut buf, m.source).unwrap();
            body.extend(buf);
        }
    }

    body
}

fn decode(data: Vec<u8>) -> Result<FvmDescriptor, Error> {
    sparse::read_image(Arc::new(data), 0)
}

fn patch(data: &mut [u8], offset: usize, value: &[u8]) {
    data[offset..offset + value.len()].copy_from_slice(value);
}

#[test]
fn header_round_trip() {
    let descriptor = two_partition_descriptor(CompressionSchema::None);
    let data = encode(&descriptor);

    let header = sparse::read_header(data.as_slice(), 0).unwrap();
    assert_eq!(header.flags, HeaderFlags::empty());
    assert_eq!(header.partition_count, 2);
    assert_eq!(header.slice_size, SLICE_SIZE);
    assert_eq!(header.maximum_disk_size, Some(MAX_VOLUME_SIZE));
    assert_eq!(
        header.header_length,
        HEADER_SIZE + 2 * PARTITION_DESCRIPTOR_SIZE + 5 * EXTENT_DESCRIPTOR_SIZE,
    );
    assert_eq!(header.header_length, HEADER_LENGTH);

    let partitions = sparse::read_partitions(data.as_slice(), 0, &header).unwrap();
    assert_eq!(partitions.len(), 2);

    let flags = PartitionFlags::ZXCRYPT | PartitionFlags::ZERO_FILL_NOT_REQUIRED;
    assert_eq!(partitions[0].name, "partition-1");
    assert_eq!(partitions[0].type_guid, TYPE_GUID_1);
    assert_eq!(partitions[0].flags, flags);
    assert_eq!(partitions[1].name, "partition-2");
    assert_eq!(partitions[1].type_guid, TYPE_GUID_2);
    assert_eq!(partitions[1].flags, flags);

    let extents = partitions
        .iter()
        .flat_map(|p| &p.extents)
        .map(|e| (e.slice_start, e.slice_count, e.extent_length))
        .collect::<Vec<_>>();
    assert_eq!(
        extents,
        [(1, 1, 48), (0, 1, 52), (2, 1, 20), (0, 1, 30), (40, 1, 61)],
    );

    assert_eq!(
        sparse::uncompressed_size(&header, &partitions),
        Some(data.len() as u64),
    );
}

#[test]
fn uncompressed_body() {
    let descriptor = two_partition_descriptor(CompressionSchema::None);
    let data = encode(&descriptor);

    let body = &data[HEADER_LENGTH as usize..];
    assert_eq!(body.len(), 48 + 52 + 20 + 30 + 61);
    assert_eq!(body, expected_body(&descriptor));

    // Spot check the fill rule of the first bytes of each partition.
    assert_eq!(&body[..4], &[5, 6, 7, 0]);
    assert_eq!(&body[120..124], &[3, 4, 5, 6]);
}

#[test]
fn compressed_body() {
    let uncompressed = encode(&two_partition_descriptor(CompressionSchema::None));
    let descriptor = two_partition_descriptor(CompressionSchema::Lz4);
    let compressed = encode(&descriptor);

    let header = sparse::read_header(compressed.as_slice(), 0).unwrap();
    assert_eq!(header.flags, HeaderFlags::LZ4);
    assert!(compressed.len() <= uncompressed.len());

    // The descriptors themselves are never compressed.
    assert_eq!(
        &compressed[HEADER_SIZE as usize..HEADER_LENGTH as usize],
        &uncompressed[HEADER_SIZE as usize..HEADER_LENGTH as usize],
    );

    let output = std::cell::RefCell::new(Vec::new());
    let mut decompressor = Lz4Decompressor::new();
    decompressor
        .prepare(Box::new(|data| {
            output.borrow_mut().extend_from_slice(data);
            Ok(())
        }))
        .unwrap();
    let result = decompressor
        .decompress(&compressed[HEADER_LENGTH as usize..])
        .unwrap();
    assert!(result.finished);
    decompressor.finalize().unwrap();
    drop(decompressor);

    assert_eq!(output.into_inner(), &uncompressed[HEADER_LENGTH as usize..]);
}

#[test]
fn decompress_to_file() {
    let uncompressed = encode(&two_partition_descriptor(CompressionSchema::None));
    let compressed = encode(&two_partition_descriptor(CompressionSchema::Lz4));

    let mut output = Cursor::new(Vec::new());
    assert!(sparse::decompress_to_file(compressed.as_slice(), &mut output).unwrap());
    let output = output.into_inner();

    let mut expected = uncompressed.clone();
    patch(
        &mut expected,
        12,
        &HeaderFlags::ZERO_FILL_NOT_REQUIRED.bits().to_le_bytes(),
    );
    assert_eq!(output, expected);

    let header = sparse::read_header(output.as_slice(), 0).unwrap();
    assert!(!header.flags.contains(HeaderFlags::LZ4));
    assert!(header.flags.contains(HeaderFlags::ZERO_FILL_NOT_REQUIRED));
}

#[test]
fn decompress_uncompressed_image() {
    let uncompressed = encode(&two_partition_descriptor(CompressionSchema::None));

    let mut output = Vec::new();
    assert!(!sparse::decompress_to_file(uncompressed.as_slice(), &mut output).unwrap());
    assert!(output.is_empty());
}

#[test]
fn decompress_truncated_image() {
    let mut compressed = encode(&two_partition_descriptor(CompressionSchema::Lz4));
    compressed.truncate(compressed.len() - 2);

    let err = sparse::decompress_to_file(compressed.as_slice(), Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompressionError);
}

fn check_reader_inverse(compression: CompressionSchema) {
    let source = two_partition_descriptor(compression);
    let decoded = decode(encode(&source)).unwrap();

    assert_eq!(decoded.options.slice_size, SLICE_SIZE);
    assert_eq!(decoded.options.max_volume_size, Some(MAX_VOLUME_SIZE));
    assert_eq!(decoded.partitions.len(), source.partitions.len());

    for (expected, actual) in source.partitions.iter().zip(&decoded.partitions) {
        assert_eq!(actual.volume.name, expected.volume.name);
        assert_eq!(actual.volume.type_guid, expected.volume.type_guid);
        assert_eq!(actual.volume.instance_guid, PLACEHOLDER_INSTANCE_GUID);
        assert_eq!(actual.volume.block_size, SLICE_SIZE);
        assert_eq!(actual.volume.encryption, EncryptionType::Zxcrypt);
        assert_eq!(
            actual.address.mappings.len(),
            expected.address.mappings.len(),
        );

        for (e, a) in expected.address.mappings.iter().zip(&actual.address.mappings) {
            assert_eq!(a.target, e.target);
            assert_eq!(a.count, e.count);
            assert_eq!(a.size, Some(SLICE_SIZE));
            // The fresh image does not declare zero filling as unnecessary.
            assert_eq!(a.options.get(&AddressMapOption::Fill), Some(&0));

            let mut expected_data = vec![0u8; e.count as usize];
            expected.reader.read_exact_at(&mut expected_data, e.source).unwrap();
            let mut actual_data = vec![0u8; a.count as usize];
            actual.reader.read_exact_at(&mut actual_data, a.source).unwrap();
            assert_eq!(actual_data, expected_data);
        }
    }
}

#[test]
fn reader_inverse_uncompressed() {
    check_reader_inverse(CompressionSchema::None);
}

#[test]
fn reader_inverse_lz4() {
    check_reader_inverse(CompressionSchema::Lz4);
}

#[test]
fn lz4_reader_backwards_reads() {
    let decoded = decode(encode(&two_partition_descriptor(CompressionSchema::Lz4))).unwrap();
    let reader = &decoded.partitions[1].reader;

    let mut tail = [0u8; 61];
    reader.read_exact_at(&mut tail, 30).unwrap();
    let mut head = [0u8; 30];
    reader.read_exact_at(&mut head, 0).unwrap();

    assert_eq!(head.to_vec(), pattern(320, 2)[25..55]);
    assert_eq!(tail.to_vec(), pattern(320, 2)[250..311]);

    // Reads past the end of the partition data fail.
    let mut buf = [0u8; 2];
    assert!(reader.read_exact_at(&mut buf, 90).is_err());
}

#[test]
fn zero_fill_flag_follows_mappings() {
    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.partitions[1].address.mappings[0]
        .options
        .insert(AddressMapOption::Fill, 0);
    let data = encode(&descriptor);

    let header = sparse::read_header(data.as_slice(), 0).unwrap();
    let partitions = sparse::read_partitions(data.as_slice(), 0, &header).unwrap();
    assert!(partitions[0].flags.contains(PartitionFlags::ZERO_FILL_NOT_REQUIRED));
    assert!(!partitions[1].flags.contains(PartitionFlags::ZERO_FILL_NOT_REQUIRED));

    // A decompressed image tells readers that filling is not needed.
    let mut output = Vec::new();
    let compressed = {
        descriptor.options.compression = CompressionSchema::Lz4;
        encode(&descriptor)
    };
    assert!(sparse::decompress_to_file(compressed.as_slice(), &mut output).unwrap());
    let decoded = decode(output).unwrap();
    assert!(
        decoded
            .partitions
            .iter()
            .flat_map(|p| &p.address.mappings)
            .all(|m| m.options.is_empty())
    );
}

#[test]
fn mapping_sizes_span_slices() {
    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.partitions[0].address.mappings = vec![AddressMap {
        size: Some(3 * SLICE_SIZE),
        ..mapping(0, 4096, 10)
    }];
    descriptor.partitions.truncate(1);
    let data = encode(&descriptor);

    let header = sparse::read_header(data.as_slice(), 0).unwrap();
    let partitions = sparse::read_partitions(data.as_slice(), 0, &header).unwrap();
    let extent = partitions[0].extents[0];

    // 4096 + 3 slices ends inside the fourth slice.
    assert_eq!(extent.slice_start, 0);
    assert_eq!(extent.slice_count, 4);
    assert_eq!(extent.extent_length, 10);
}

#[test]
fn partition_without_mappings() {
    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.partitions[0].address.mappings.clear();
    let data = encode(&descriptor);

    let header = sparse::read_header(data.as_slice(), 0).unwrap();
    assert_eq!(
        header.header_length,
        HEADER_SIZE + 2 * PARTITION_DESCRIPTOR_SIZE + 2 * EXTENT_DESCRIPTOR_SIZE,
    );

    let decoded = decode(data).unwrap();
    assert!(decoded.partitions[0].address.mappings.is_empty());
    assert_eq!(decoded.partitions[0].reader.file_len().unwrap(), 0);
    assert_eq!(decoded.partitions[1].address.mappings.len(), 2);
}

#[test]
fn rejects_short_partition_reader() {
    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.partitions[1].reader = Arc::new(vec![0u8; 100]);

    let err = sparse::write_image(&descriptor, Vec::new()).unwrap_err();
    assert_matches!(&err, Error::PartitionRead { name, .. } if name == "partition-2");
    assert_eq!(err.kind(), ErrorKind::IoError);
}

#[test]
fn rejects_invalid_partition_names() {
    for name in ["", "a-name-longer-than-the-field", "nul\0name"] {
        let mut descriptor = two_partition_descriptor(CompressionSchema::None);
        descriptor.partitions[0].volume.name = name.to_owned();

        // An empty name fits the field. The others do not.
        let result = sparse::write_image(&descriptor, Vec::new());
        if name.is_empty() {
            assert!(result.is_ok());
        } else {
            assert_matches!(result, Err(Error::InvalidPartitionName { index: 0, .. }));
        }
    }
}

#[test]
fn rejects_zero_slice_size_on_write() {
    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.options.slice_size = 0;

    let err = sparse::write_image(&descriptor, Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ZeroSliceSize);
}

#[test]
fn output_write_failures() {
    // Room for the header only.
    let mut buf = [0u8; HEADER_SIZE as usize];
    let descriptor = two_partition_descriptor(CompressionSchema::None);
    let err = sparse::write_image(&descriptor, &mut buf[..]).unwrap_err();
    assert_matches!(err, Error::DataWrite("partition", _));

    // Room for the descriptors, but not the compressed data.
    let mut buf = [0u8; HEADER_LENGTH as usize + 1];
    let descriptor = two_partition_descriptor(CompressionSchema::Lz4);
    let err = sparse::write_image(&descriptor, &mut buf[..]).unwrap_err();
    assert_matches!(err, Error::DataWrite("extent_data", _));
    assert_eq!(err.kind(), ErrorKind::IoError);
}

#[test]
fn rejects_bad_states() {
    let image = encode(&two_partition_descriptor(CompressionSchema::None));
    let extent_1_offset = PARTITION_1_EXTENTS_OFFSET;

    let cases: &[(&str, usize, &[u8], ErrorKind)] = &[
        ("sparse magic", 0, &[0u8; 8], ErrorKind::BadMagic),
        ("version", 8, &2u32.to_le_bytes(), ErrorKind::UnsupportedVersion),
        ("reserved header flag", 12, &(1u32 << 1).to_le_bytes(), ErrorKind::UnknownFlag),
        ("high header flag", 12, &(1u32 << 31).to_le_bytes(), ErrorKind::UnknownFlag),
        ("header length", 16, &47u64.to_le_bytes(), ErrorKind::ShortHeader),
        ("slice size", 24, &0u64.to_le_bytes(), ErrorKind::ZeroSliceSize),
        ("partition magic", PARTITION_1_OFFSET, &[0u8; 4], ErrorKind::BadMagic),
        (
            "partition flags",
            PARTITION_1_OFFSET + 44,
            &(1u32 << 2).to_le_bytes(),
            ErrorKind::UnknownFlag,
        ),
        ("extent magic", extent_1_offset, &[0u8; 8], ErrorKind::BadMagic),
        (
            "extent length",
            extent_1_offset + 24,
            &(SLICE_SIZE + 1).to_le_bytes(),
            ErrorKind::ExtentGeometry,
        ),
        (
            "extent slice range",
            extent_1_offset + 8,
            &u64::MAX.to_le_bytes(),
            ErrorKind::ExtentGeometry,
        ),
        (
            "overlapping extent",
            extent_1_offset + 32 + 8,
            &1u64.to_le_bytes(),
            ErrorKind::OverlappingExtents,
        ),
    ];

    for (name, offset, value, kind) in cases {
        let mut data = image.clone();
        patch(&mut data, *offset, value);

        let err = decode(data).unwrap_err();
        assert_eq!(err.kind(), *kind, "{name}: {err}");
    }
}

#[test]
fn rejects_truncated_descriptors() {
    let image = encode(&two_partition_descriptor(CompressionSchema::None));

    let err = decode(image[..HEADER_SIZE as usize + 10].to_vec()).unwrap_err();
    assert_matches!(err, Error::DataRead("partition", _));
    assert_eq!(err.kind(), ErrorKind::IoError);

    let err = decode(image[..HEADER_SIZE as usize - 1].to_vec()).unwrap_err();
    assert_matches!(err, Error::DataRead("header", _));
}

#[test]
fn rejects_header_length_mismatch() {
    let mut image = encode(&two_partition_descriptor(CompressionSchema::None));
    patch(&mut image, 16, &(HEADER_LENGTH + 8).to_le_bytes());

    assert_matches!(
        decode(image),
        Err(Error::HeaderLengthMismatch {
            expected: 320,
            actual: HEADER_LENGTH,
        })
    );
}

#[test]
fn rejects_partition_name_without_utf8_prefix() {
    let mut image = encode(&two_partition_descriptor(CompressionSchema::None));
    patch(&mut image, PARTITION_1_OFFSET + 20, &[0xff, 0xfe]);

    assert_matches!(
        decode(image),
        Err(Error::InvalidPartitionName { index: 0, .. })
    );
}

#[test]
fn ignores_bytes_after_name_terminator() {
    let mut image = encode(&two_partition_descriptor(CompressionSchema::None));
    patch(&mut image, PARTITION_1_OFFSET + 20 + 12, &[0xff, 0xfe]);

    let decoded = decode(image).unwrap();
    assert_eq!(decoded.partitions[0].volume.name, "partition-1");
}

#[test]
fn rejects_overlap_with_earlier_extent() {
    let mut image = encode(&two_partition_descriptor(CompressionSchema::None));
    // Extent #2 of partition-1 becomes slices [0, 100).
    let extent_3_offset = PARTITION_1_EXTENTS_OFFSET + 2 * EXTENT_DESCRIPTOR_SIZE as usize;
    patch(&mut image, extent_3_offset + 8, &0u64.to_le_bytes());
    patch(&mut image, extent_3_offset + 16, &100u64.to_le_bytes());

    let err = decode(image).unwrap_err();
    assert_matches!(
        err,
        Error::OverlappingExtents {
            index: 0,
            extent: 2,
            start: 0,
            end: 100,
            ..
        }
    );
    assert_eq!(err.kind(), ErrorKind::OverlappingExtents);
}

/// Encode a single partition whose extents cover the given slice ranges.
fn encode_slice_ranges(ranges: &[(u64, u64)]) -> Vec<u8> {
    let mappings = ranges
        .iter()
        .map(|(start, end)| AddressMap {
            size: Some((end - start) * SLICE_SIZE),
            ..mapping(0, start * SLICE_SIZE, 1)
        })
        .collect();

    let mut descriptor = two_partition_descriptor(CompressionSchema::None);
    descriptor.partitions.truncate(1);
    descriptor.partitions[0].address.mappings = mappings;

    encode(&descriptor)
}

#[test]
fn overlap_detection_corners() {
    let overlapping: &[(&str, &[(u64, u64)])] = &[
        ("before", &[(2, 4), (1, 3)]),
        ("after", &[(2, 4), (3, 5)]),
        ("inside", &[(1, 4), (2, 3)]),
        ("surrounding", &[(2, 3), (1, 4)]),
        ("exact", &[(2, 4), (2, 4)]),
        ("multiple ranges", &[(0, 1), (3, 4), (0, 5)]),
        ("between ranges", &[(0, 2), (4, 6), (1, 5)]),
    ];

    for (name, ranges) in overlapping {
        let result = decode(encode_slice_ranges(ranges));
        assert_matches!(result, Err(Error::OverlappingExtents { .. }), "{name}");
    }

    let disjoint: &[(&str, &[(u64, u64)])] = &[
        ("adjacent", &[(0, 2), (2, 4)]),
        ("reversed", &[(4, 6), (2, 4), (0, 2)]),
        ("gap", &[(10, 11), (0, 1)]),
    ];

    for (name, ranges) in disjoint {
        let result = decode(encode_slice_ranges(ranges));
        assert!(result.is_ok(), "{name}: {result:?}");
    }
}

#[test]
fn same_slices_in_different_partitions() {
    // Both partitions use virtual slice 0. Only extents within a partition
    // conflict.
    let image = encode(&two_partition_descriptor(CompressionSchema::None));
    let decoded = decode(image).unwrap();

    assert_eq!(decoded.partitions[0].address.mappings[1].target, 0);
    assert_eq!(decoded.partitions[1].address.mappings[0].target, 0);
}

#[test]
fn image_at_offset() {
    let image = encode(&two_partition_descriptor(CompressionSchema::Lz4));

    let mut data = vec![0xaa; 4096];
    data.extend_from_slice(&image);

    let decoded = sparse::read_image(Arc::new(data), 4096).unwrap();
    let partition = &decoded.partitions[0];
    let mut buf = vec![0u8; 20];
    partition.reader.read_exact_at(&mut buf, 100).unwrap();

    assert_eq!(buf, pattern(256, 1)[190..210]);
}
