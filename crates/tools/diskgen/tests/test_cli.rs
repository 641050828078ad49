use std::fs;
use std::process::Command;

const CONFIG: &str = r#"
[image]
type = "gpt"
disk_guid = "01234567-89AB-CDEF-0123-456789ABCDEF"
boot_partition = "data"

[[image.parts]]
type = "raw"
name = "bootloader"
start = 1024
content = { type = "raw", file = "bootloader.bin" }

[[image.parts]]
type = "partition"
name = "data"
fstype = "ext4"
size = "64 K"
"#;

#[test]
fn test_build_and_inspect() {
    let tempdir = tempfile::tempdir().unwrap();
    fs::write(tempdir.path().join("bootloader.bin"), [0x42; 512]).unwrap();
    let config = tempdir.path().join("image.toml");
    fs::write(&config, CONFIG).unwrap();
    let image = tempdir.path().join("image.raw");

    let output = Command::new(env!("CARGO_BIN_EXE_diskgen"))
        .arg("build")
        .arg("-o")
        .arg(&image)
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Table will be relocated"));
    assert!(stderr.contains("The final layout:"));
    let bytes = fs::read(&image).unwrap();
    assert_eq!(bytes[1024..1536], [0x42; 512]);

    let output = Command::new(env!("CARGO_BIN_EXE_diskgen"))
        .arg("inspect")
        .arg(&image)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Disk id: 01234567-89AB-CDEF-0123-456789ABCDEF"));
    assert!(stdout.contains("GPT entries at LBA 3"));
    assert!(stdout.contains("1: type: 0FC63DAF-8483-4772-8E79-3D69D8477DE4, start: 35, size: 128, bootable"));
}

#[test]
fn test_invalid_config() {
    let tempdir = tempfile::tempdir().unwrap();
    let config = tempdir.path().join("image.toml");
    fs::write(&config, "[image]\ntype = \"mbr\"\n\n[[image.parts]]\ntype = \"empty\"\nname = \"gap\"\n").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_diskgen"))
        .arg("build")
        .arg("-o")
        .arg(tempdir.path().join("image.raw"))
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
}
