//! Partition table backend using `sfdisk`.

use std::fmt::Write;
use std::path::Path;

use tracing::debug;
use xscript::{Cmd, ParentEnv, Run};

use super::gpt::GPT_ENTRY_COUNT;
use super::{DiskId, EntryKind, PartitionTableDef, TableBackend};
use crate::{Error, Result};

/// Name of the `sfdisk` executable.
const SFDISK: &str = "sfdisk";

/// Backend writing partition tables with `sfdisk`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SfdiskBackend;

/// Render the `sfdisk` script for the given table.
pub fn sfdisk_script(table: &PartitionTableDef) -> String {
    let mut script = String::new();
    match table.disk_id {
        DiskId::Mbr(_) => script.push_str("label: dos\n"),
        DiskId::Gpt(_) => script.push_str("label: gpt\n"),
    }
    writeln!(&mut script, "label-id: {}", table.disk_id).ok();
    script.push_str("unit: sectors\n");
    if matches!(table.disk_id, DiskId::Gpt(_)) {
        writeln!(&mut script, "table-length: {}", GPT_ENTRY_COUNT).ok();
        writeln!(&mut script, "first-lba: {}", table.first_usable_lba()).ok();
    }
    for entry in &table.entries {
        write!(
            &mut script,
            "{}: start={},size={},type={}",
            entry.number, entry.start, entry.size, entry.ty
        )
        .ok();
        if let Some(guid) = entry.guid {
            write!(&mut script, ",uuid={guid}").ok();
        }
        match table.disk_id {
            DiskId::Mbr(_) if entry.bootable && entry.kind != EntryKind::Extended => {
                script.push_str(",bootable");
            }
            DiskId::Gpt(_) => {
                write!(&mut script, ",name=\"{}\"", entry.name.replace('"', "")).ok();
                if entry.bootable {
                    script.push_str(",attrs=\"LegacyBIOSBootable\"");
                }
            }
            _ => {}
        }
        script.push('\n');
    }
    script
}

impl TableBackend for SfdiskBackend {
    fn name(&self) -> &str {
        "sfdisk"
    }

    fn commit(&self, path: &Path, table: &PartitionTableDef) -> Result<()> {
        let script = sfdisk_script(table);
        debug!("sfdisk script:\n{script}");
        let mut cmd: Cmd<std::ffi::OsString> = Cmd::new(SFDISK);
        cmd.add_arg("--no-reread").add_arg(path);
        ParentEnv
            .run(
                cmd.with_stdin(script)
                    .with_stdout(xscript::Out::Capture),
            )
            .map_err(|error| Error::tool("unable to write partition table with sfdisk", error))?;
        Ok(())
    }
}
