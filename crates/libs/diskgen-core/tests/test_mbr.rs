use std::fs::{self, File};
use std::io::Read;

use diskgen_core::content::EmptyContent;
use diskgen_core::disk::mbr::{mbr_types, MbrId};
use diskgen_core::disk::stream::{ImgStream, PartitionEntry};
use diskgen_core::disk::DiskId;
use diskgen_core::{BuildContext, FsType, Label, Region, SizeType};

fn partition(name: &str, size: u64) -> Region {
    Region::partition(name, FsType::Ext4, EmptyContent::new()).with_size(SizeType::new(size))
}

fn read_entries(path: &std::path::Path) -> (ImgStream<File>, Vec<PartitionEntry>) {
    let mut stream = ImgStream::new(File::open(path).unwrap()).unwrap();
    let mut entries = Vec::new();
    while let Some(partition) = stream.next_partition().unwrap() {
        entries.push(partition.entry().clone());
    }
    (stream, entries)
}

fn entry_at(image: &[u8], sector: usize, idx: usize) -> &[u8] {
    &image[sector * 512 + 0x1BE + idx * 16..][..16]
}

#[test]
fn test_empty_image() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr();
    label.prepare(&mut ctx).unwrap();
    label.create(&ctx, &path).unwrap();
    let image = fs::read(&path).unwrap();
    assert_eq!(image.len(), 512);
    assert_eq!(image[510..], [0x55, 0xAA]);
    assert!(image[0x1BE..0x1FE].iter().all(|byte| *byte == 0));
}

#[test]
fn test_disk_id() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr().with_part(partition("root", 4096));
    label.set_mbr_disk_id(MbrId::new(0x12345678)).unwrap();
    label.prepare(&mut ctx).unwrap();
    label.create(&ctx, &path).unwrap();
    let image = fs::read(&path).unwrap();
    assert_eq!(image[0x1B8..0x1BC], [0x78, 0x56, 0x34, 0x12]);
    let (stream, _) = read_entries(&path);
    assert_eq!(stream.disk_id(), DiskId::Mbr(MbrId::new(0x12345678)));
}

#[test]
fn test_partition_positions() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr()
        .with_part(Region::raw("bootloader", EmptyContent::with_size(SizeType::new(6144))))
        .with_part(partition("a", 1024))
        .with_part(partition("b", 1024));
    label.prepare(&mut ctx).unwrap();
    label.create(&ctx, &path).unwrap();
    let (stream, entries) = read_entries(&path);
    assert!(stream.extended().is_none());
    let positions = entries
        .iter()
        .map(|entry| (entry.start(), entry.size()))
        .collect::<Vec<_>>();
    assert_eq!(positions, [(13, 2), (15, 2)]);
    assert!(entries.iter().all(|entry| *entry.ty() == mbr_types::LINUX));
    assert_eq!(fs::metadata(&path).unwrap().len(), 17 * 512);
}

#[test]
fn test_four_partitions_are_primary() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr();
    for idx in 0..4 {
        label.push(partition(&format!("p{idx}"), 1024));
    }
    label.prepare(&mut ctx).unwrap();
    assert!(label
        .parts()
        .iter()
        .all(|part| !part.name().starts_with("EBR")));
    label.create(&ctx, &path).unwrap();
    let (stream, entries) = read_entries(&path);
    assert!(stream.extended().is_none());
    assert_eq!(entries.len(), 4);
}

#[test]
fn test_extended_partition_chain() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr()
        .with_part(partition("p1", 1024))
        .with_part(partition("p2", 1024))
        .with_part(partition("p3", 1024))
        .with_part(Region::empty("gap").with_size(SizeType::new(1024)));
    for idx in 4..=7 {
        label.push(partition(&format!("p{idx}"), 1024));
    }
    label.prepare(&mut ctx).unwrap();
    let table = label.partition_table().unwrap();
    let numbers = table
        .entries
        .iter()
        .map(|entry| entry.number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, [1, 2, 3, 4, 5, 6, 7, 8]);
    label.create(&ctx, &path).unwrap();

    let (stream, entries) = read_entries(&path);
    let extended = stream.extended().unwrap();
    assert_eq!((extended.start(), extended.size()), (9, 12));
    let starts = entries.iter().map(|entry| entry.start()).collect::<Vec<_>>();
    assert_eq!(starts, [1, 3, 5, 10, 13, 16, 19]);
    assert!(entries.iter().all(|entry| entry.size() == 2));

    let image = fs::read(&path).unwrap();
    assert_eq!(image.len(), 21 * 512);
    assert_eq!(entry_at(&image, 0, 3)[4], 0x0F);
    // First EBR: the partition relative to the EBR and a link to the next EBR
    // relative to the extended partition.
    let first = entry_at(&image, 9, 0);
    assert_eq!(first[4], 0x83);
    assert_eq!(first[8..12], 1u32.to_le_bytes());
    assert_eq!(first[12..16], 2u32.to_le_bytes());
    let link = entry_at(&image, 9, 1);
    assert_eq!(link[4], 0x05);
    assert_eq!(link[8..12], 3u32.to_le_bytes());
    assert_eq!(link[12..16], 3u32.to_le_bytes());
    assert_eq!(image[9 * 512 + 510..10 * 512], [0x55, 0xAA]);
    // The last EBR terminates the chain.
    assert!(entry_at(&image, 18, 1).iter().all(|byte| *byte == 0));
}

#[test]
fn test_fixed_partition_comes_first() {
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr();
    for idx in 1..=4 {
        label.push(partition(&format!("p{idx}"), 1024));
    }
    label.push(partition("fixed", 1024).with_start(SizeType::new(1024 * 1024)));
    label.prepare(&mut ctx).unwrap();
    // Floating partitions follow the fixed one, hence, `p3` and `p4` are logical.
    assert!(label.part("EBR Header (fixed)").is_none());
    assert!(label.part("EBR Header (p1)").is_none());
    let ebr = label.part("EBR Header (p3)").unwrap();
    assert_eq!(ebr.start(), SizeType::new(1024 * 1024 + 3072));
    assert!(label.part("EBR Header (p4)").is_some());
    label.partition_table().unwrap();
}

#[test]
fn test_fixed_logical_partitions_out_of_order() {
    const MIB: u64 = 1024 * 1024;
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr();
    for (name, start) in [("p0", 2), ("p1", 3), ("p2", 4), ("p3", 1), ("p4", 5)] {
        label.push(partition(name, MIB / 2).with_start(SizeType::new(start * MIB)));
    }
    label.prepare(&mut ctx).unwrap();
    assert_eq!(
        label.part("EBR Header (p2)").unwrap().start(),
        SizeType::new(4 * MIB - 512)
    );
    assert_eq!(
        label.part("EBR Header (p4)").unwrap().start(),
        SizeType::new(5 * MIB - 512)
    );
    label.create(&ctx, &path).unwrap();

    let (stream, entries) = read_entries(&path);
    let extended = stream.extended().unwrap();
    assert_eq!(extended.start(), 4 * 2048 - 1);
    let starts = entries.iter().map(|entry| entry.start()).collect::<Vec<_>>();
    assert_eq!(starts, [2048, 4096, 6144, 8192, 10240]);
}

#[test]
fn test_boot_flag_and_types() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr()
        .with_part(
            Region::partition("efi", FsType::Esp, EmptyContent::new())
                .with_size(SizeType::new(2048)),
        )
        .with_part(
            Region::partition("boot", FsType::Fat32, EmptyContent::new())
                .with_size(SizeType::new(2048)),
        )
        .with_part(partition("root", 2048));
    label.set_boot_partition("boot");
    label.prepare(&mut ctx).unwrap();
    label.create(&ctx, &path).unwrap();
    let (_, entries) = read_entries(&path);
    let types = entries.iter().map(|entry| *entry.ty()).collect::<Vec<_>>();
    assert_eq!(
        types,
        [mbr_types::EFI, mbr_types::FAT32_LBA, mbr_types::LINUX]
    );
    let bootable = entries
        .iter()
        .map(|entry| entry.is_bootable())
        .collect::<Vec<_>>();
    assert_eq!(bootable, [false, true, false]);
}

#[test]
fn test_unknown_boot_partition() {
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr().with_part(partition("root", 1024));
    label.set_boot_partition("boot");
    assert!(label.prepare(&mut ctx).is_err());
}

#[test]
fn test_partition_content_read_back() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let data_path = tempdir.path().join("data.bin");
    let mut data = vec![0xA5; 3 * 4096];
    data[4096..8192].fill(0);
    fs::write(&data_path, &data).unwrap();
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::mbr().with_part(Region::partition(
        "data",
        FsType::Ext4,
        diskgen_core::content::RawContent::new(&data_path),
    ));
    label.prepare(&mut ctx).unwrap();
    label.create(&ctx, &path).unwrap();
    let mut stream = ImgStream::new(File::open(&path).unwrap()).unwrap();
    let mut partition = stream.next_partition().unwrap().unwrap();
    let mut content = Vec::new();
    partition.read_to_end(&mut content).unwrap();
    assert_eq!(content, data);
}
