use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use diskgen_core::content::{EmptyContent, RawContent};
use diskgen_core::disk::gpt::{gpt_types, Guid};
use diskgen_core::disk::stream::{ImgStream, PartitionEntry};
use diskgen_core::disk::DiskId;
use diskgen_core::label::GPT_RELOCATION_NOTICE;
use diskgen_core::{BuildContext, FsType, Label, Region, SizeType};

const TABLE_SIZE: usize = 16384;

fn partition(name: &str, size: u64) -> Region {
    Region::partition(name, FsType::Ext4, EmptyContent::new()).with_size(SizeType::new(size))
}

fn read_entries(path: &Path) -> (ImgStream<File>, Vec<PartitionEntry>) {
    let mut stream = ImgStream::new(File::open(path).unwrap()).unwrap();
    let mut entries = Vec::new();
    while let Some(partition) = stream.next_partition().unwrap() {
        entries.push(partition.entry().clone());
    }
    (stream, entries)
}

/// Shared buffer capturing the output of a `tracing` subscriber.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Build the image and return the captured log output.
fn build(mut label: Label, path: &Path) -> (Label, String) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let mut ctx = BuildContext::new().unwrap();
        label.prepare(&mut ctx).unwrap();
        label.create(&ctx, path).unwrap();
    });
    (label, captured.contents())
}

/// Check that the primary entries at `lba` equal the backup entries.
fn assert_tables_equal(image: &[u8], lba: usize) {
    let sectors = image.len() / 512;
    let backup_start = (sectors - 33) * 512;
    let primary = &image[lba * 512..][..TABLE_SIZE];
    let backup = &image[backup_start..][..TABLE_SIZE];
    assert_eq!(primary, backup);
    assert!(primary.iter().any(|byte| *byte != 0));
}

/// First usable LBA of the primary and the backup header.
fn first_usable_lba(image: &[u8]) -> u64 {
    let read = |offset: usize| u64::from_le_bytes(image[offset + 40..][..8].try_into().unwrap());
    let primary = read(512);
    assert_eq!(read(image.len() - 512), primary);
    primary
}

fn bootloader(dir: &Path, start: u64, size: usize) -> (Region, Vec<u8>) {
    let path = dir.join(format!("bootloader-{start}.bin"));
    let data = (0..size).map(|idx| (idx % 251) as u8 + 1).collect::<Vec<_>>();
    fs::write(&path, &data).unwrap();
    let region = Region::raw(format!("bootloader-{start}"), RawContent::new(path))
        .with_start(SizeType::new(start));
    (region, data)
}

#[test]
fn test_partition_positions() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let guid: Guid = "01234567-89AB-CDEF-0123-456789ABCDEF".parse().unwrap();
    let mut label = Label::gpt()
        .with_part(partition("a", 1024))
        .with_part(
            Region::partition("efi", FsType::Esp, EmptyContent::new())
                .with_size(SizeType::new(1024)),
        );
    label.set_gpt_disk_guid(guid).unwrap();
    label.set_boot_partition("efi");
    let (label, output) = build(label, &path);
    assert!(!label.gpt_table_relocated());
    assert!(!output.contains(GPT_RELOCATION_NOTICE));

    let (stream, entries) = read_entries(&path);
    assert_eq!(stream.disk_id(), DiskId::Gpt(guid));
    assert_eq!(stream.gpt_entries_lba(), Some(2));
    let positions = entries
        .iter()
        .map(|entry| (entry.start(), entry.size()))
        .collect::<Vec<_>>();
    assert_eq!(positions, [(34, 2), (36, 2)]);
    assert_eq!(*entries[0].ty(), gpt_types::LINUX);
    assert_eq!(*entries[1].ty(), gpt_types::EFI);
    assert!(entries[1].is_bootable());

    let image = fs::read(&path).unwrap();
    assert_eq!(image.len(), (38 + 33) * 512);
    assert_eq!(&image[512..520], b"EFI PART");
    assert_eq!(&image[image.len() - 512..][..8], b"EFI PART");
    assert_eq!(image[0x1BE + 4], 0xEE);
    assert_eq!(first_usable_lba(&image), 34);
    assert_tables_equal(&image, 2);
}

#[test]
fn test_overlap_with_header() {
    let mut ctx = BuildContext::new().unwrap();
    let mut label = Label::gpt().with_part(
        Region::empty("empty region")
            .with_start(SizeType::new(600))
            .with_size(SizeType::new(100)),
    );
    let error = label.prepare(&mut ctx).unwrap_err();
    assert_eq!(
        error.to_string(),
        "Part 'empty region' overlaps with 'GPT Header'"
    );
}

#[test]
fn test_relocation() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let (region, data) = bootloader(tempdir.path(), 1024, 512);
    let label = Label::gpt()
        .with_part(region)
        .with_part(partition("root", 4096));
    let (label, output) = build(label, &path);
    assert!(label.gpt_table_relocated());
    assert_eq!(output.matches(GPT_RELOCATION_NOTICE).count(), 1);

    let (stream, entries) = read_entries(&path);
    assert_eq!(stream.gpt_entries_lba(), Some(3));
    // The partition follows the relocated table.
    assert_eq!(entries[0].start(), 35);

    let image = fs::read(&path).unwrap();
    assert_eq!(&image[1024..1536], data.as_slice());
    // Partitions must not overlap with the moved entries.
    assert_eq!(first_usable_lba(&image), 35);
    assert_tables_equal(&image, 3);
}

#[test]
fn test_relocation_unaligned_region() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let (region, data) = bootloader(tempdir.path(), 1088, 128);
    let label = Label::gpt()
        .with_part(region)
        .with_part(partition("root", 4096));
    let (_, output) = build(label, &path);
    assert_eq!(output.matches(GPT_RELOCATION_NOTICE).count(), 1);

    let (stream, _) = read_entries(&path);
    assert_eq!(stream.gpt_entries_lba(), Some(3));
    let image = fs::read(&path).unwrap();
    assert_eq!(&image[1088..1216], data.as_slice());
    assert_tables_equal(&image, 3);
}

#[test]
fn test_relocation_multiple_regions() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("image.raw");
    let (first, first_data) = bootloader(tempdir.path(), 1024, 4096);
    let (second, second_data) = bootloader(tempdir.path(), 6656, 512);
    let label = Label::gpt()
        .with_part(second)
        .with_part(first)
        .with_part(partition("root", 4096));
    let (_, output) = build(label, &path);
    assert_eq!(output.matches(GPT_RELOCATION_NOTICE).count(), 1);

    let (stream, entries) = read_entries(&path);
    assert_eq!(stream.gpt_entries_lba(), Some(14));
    assert_eq!(entries[0].start(), 14 + 32);
    let image = fs::read(&path).unwrap();
    assert_eq!(&image[1024..5120], first_data.as_slice());
    assert_eq!(&image[6656..7168], second_data.as_slice());
    assert_tables_equal(&image, 14);
}
