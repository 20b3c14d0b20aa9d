//! Partition table inspection and mutation.
//!
//! The table itself is read and written by an external tool behind [`PartitionTool`]; the
//! shipped implementation drives `parted` in script mode.  Partition offsets are always byte
//! offsets with an exclusive end, whatever the tool uses internally.

use std::{
    collections::BTreeSet,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};

use crate::{
    error::{Error, Result},
    util::run_tool,
    SECTOR_SIZE,
};

/// Sectors at the end of a GPT disk holding the backup entry array and header.
pub const GPT_TRAILER_SECTORS: u64 = 33;

/// The kind of partition table on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableScheme {
    Msdos,
    Gpt,
    Other,
}

impl TableScheme {
    fn from_label(label: &str) -> Self {
        match label {
            "msdos" => Self::Msdos,
            "gpt" => Self::Gpt,
            _ => Self::Other,
        }
    }

    /// Bytes at the end of the disk that no partition may use.
    pub fn trailer(self) -> u64 {
        match self {
            Self::Gpt => GPT_TRAILER_SECTORS * SECTOR_SIZE,
            Self::Msdos | Self::Other => 0,
        }
    }
}

/// One entry of a partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRecord {
    /// Partition number as assigned by the table (1-based).
    pub index: u32,
    /// Byte offset of the first byte.
    pub start: u64,
    /// Byte offset one past the last byte.
    pub end: u64,
}

impl PartitionRecord {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// The partition table primitive.
pub trait PartitionTool {
    /// Lists the partitions on `device`, in ascending index order.
    fn list(&self, device: &Path) -> Result<Vec<PartitionRecord>>;

    /// Reports which kind of table `device` carries.
    fn scheme(&self, device: &Path) -> Result<TableScheme>;

    /// Removes partition `index`.
    fn delete(&self, device: &Path, index: u32) -> Result<()>;

    /// Creates a partition covering `start..end`.  The tool picks the index.
    fn create(&self, device: &Path, start: u64, end: u64) -> Result<()>;
}

/// The set of partition indices present on a device at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot(BTreeSet<u32>);

impl IndexSnapshot {
    pub fn take(tool: &(impl PartitionTool + ?Sized), device: &Path) -> Result<Self> {
        Ok(Self::from_records(&tool.list(device)?))
    }

    pub fn from_records(records: &[PartitionRecord]) -> Self {
        Self(records.iter().map(|r| r.index).collect())
    }

    /// Returns the one index present in `after` but not in `self`.
    ///
    /// Fails if there is no such index or more than one.
    pub fn added_index(&self, after: &IndexSnapshot, device: &Path) -> Result<u32> {
        let added: Vec<u32> = after.0.difference(&self.0).copied().collect();
        match added.as_slice() {
            [index] => Ok(*index),
            _ => Err(Error::AmbiguousPartition {
                device: device.to_path_buf(),
                found: added,
            }),
        }
    }
}

/// Creates a partition and reports the index the tool assigned to it.
///
/// The index set is snapshotted before and after the creation and the difference must be exactly
/// one index.  Gaps and reused indices are handled because only set membership matters.
pub fn create_identified(
    tool: &(impl PartitionTool + ?Sized),
    device: &Path,
    start: u64,
    end: u64,
) -> Result<u32> {
    let before = IndexSnapshot::take(tool, device)?;
    tool.create(device, start, end)?;
    let after = IndexSnapshot::take(tool, device)?;
    let index = before.added_index(&after, device)?;
    info!(
        "created partition {index} on {} at {start}..{end}",
        device.display()
    );
    Ok(index)
}

/// `parted` driven in script mode.
#[derive(Debug, Clone)]
pub struct Parted {
    program: PathBuf,
}

impl Default for Parted {
    fn default() -> Self {
        Self::new("parted")
    }
}

impl Parted {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, options: &[&str], device: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        // --fix lets script mode move a GPT backup header stranded by growing the image
        cmd.args(["--script", "--fix"]).args(options).arg(device);
        cmd
    }
}

impl PartitionTool for Parted {
    fn list(&self, device: &Path) -> Result<Vec<PartitionRecord>> {
        let mut cmd = self.command(&["--machine"], device);
        cmd.args(["unit", "B", "print"]);
        let output = run_tool(&mut cmd)?;
        let records = parse_machine_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!("{}: {records:?}", device.display());
        Ok(records)
    }

    fn scheme(&self, device: &Path) -> Result<TableScheme> {
        let mut cmd = self.command(&["--machine"], device);
        cmd.args(["unit", "B", "print"]);
        let output = run_tool(&mut cmd)?;
        let scheme = parse_machine_scheme(&String::from_utf8_lossy(&output.stdout))?;
        debug!("{}: {scheme:?} table", device.display());
        Ok(scheme)
    }

    fn delete(&self, device: &Path, index: u32) -> Result<()> {
        let mut cmd = self.command(&[], device);
        cmd.arg("rm").arg(index.to_string());
        run_tool(&mut cmd)?;
        info!("deleted partition {index} on {}", device.display());
        Ok(())
    }

    fn create(&self, device: &Path, start: u64, end: u64) -> Result<()> {
        let mut cmd = self.command(&[], device);
        // parted's end offset is inclusive
        let bounds: [OsString; 2] = [format!("{start}B").into(), format!("{}B", end - 1).into()];
        cmd.args(["unit", "B", "mkpart", "primary"]).args(bounds);
        run_tool(&mut cmd)?;
        Ok(())
    }
}

fn parse_bytes(field: &str) -> Option<u64> {
    field.strip_suffix('B')?.parse().ok()
}

/// Reads the table type from the disk line of `parted --machine` output.
///
/// The disk line follows the unit line and reads
/// `path:size:transport:logical-sector:physical-sector:label:model:flags;`.
fn parse_machine_scheme(output: &str) -> Result<TableScheme> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let disk = lines.nth(1).unwrap_or_default();
    disk.trim_end_matches(';')
        .split(':')
        .nth(5)
        .map(TableScheme::from_label)
        .ok_or_else(|| Error::ToolOutput {
            tool: "parted".into(),
            line: disk.to_string(),
        })
}

/// Parses `parted --machine unit B print` output.
///
/// The first lines describe the unit and the disk; each following line is
/// `index:start:end:size:fs:name:flags;` with an inclusive end.
fn parse_machine_output(output: &str) -> Result<Vec<PartitionRecord>> {
    let mut records = vec![];

    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let malformed = || Error::ToolOutput {
            tool: "parted".into(),
            line: line.to_string(),
        };
        let mut fields = line.trim_end_matches(';').split(':');
        let index = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let start = fields.next().and_then(parse_bytes).ok_or_else(malformed)?;
        let last = fields.next().and_then(parse_bytes).ok_or_else(malformed)?;
        if last < start {
            return Err(malformed());
        }

        records.push(PartitionRecord {
            index,
            start,
            end: last + 1,
        });
    }

    records.sort_by_key(|r| r.index);
    Ok(records)
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use similar_asserts::assert_eq;

    use super::*;

    const MSDOS: &str = "BYT;
/dev/loop0:272629760B:loopback:512:512:msdos:Loopback device:;
2:17301504B:272629759B:255328256B:::;
1:262144B:17039359B:16777216B:ext2::boot;
";

    #[test]
    fn test_parse_machine_output() {
        assert_eq!(
            parse_machine_output(MSDOS).unwrap(),
            vec![
                PartitionRecord {
                    index: 1,
                    start: 262144,
                    end: 17039360
                },
                PartitionRecord {
                    index: 2,
                    start: 17301504,
                    end: 272629760
                },
            ]
        );
        assert_eq!(
            parse_machine_output(MSDOS).unwrap()[1].size(),
            255328256
        );
    }

    #[test]
    fn test_parse_empty_table() {
        let output = "BYT;\n/dev/loop1:8388608B:loopback:512:512:gpt:Loopback device:;\n";
        assert!(parse_machine_output(output).unwrap().is_empty());
    }

    #[test]
    fn test_parse_scheme() {
        assert_eq!(parse_machine_scheme(MSDOS).unwrap(), TableScheme::Msdos);
        let gpt = "BYT;\n/tmp/disk.img:294142976B:file:512:512:gpt::;\n1:1048576B:2097151B:1048576B::boot:;\n";
        assert_eq!(parse_machine_scheme(gpt).unwrap(), TableScheme::Gpt);
        let bare = "BYT;\n/dev/loop3:8388608B:loopback:512:512:loop:Loopback device:;\n";
        assert_eq!(parse_machine_scheme(bare).unwrap(), TableScheme::Other);
        assert!(matches!(
            parse_machine_scheme("BYT;\n"),
            Err(Error::ToolOutput { .. })
        ));

        assert_eq!(TableScheme::Gpt.trailer(), 33 * 512);
        assert_eq!(TableScheme::Msdos.trailer(), 0);
    }

    #[test]
    fn test_parse_malformed() {
        for line in ["1:abc:100B:;", "1:100B;", "1:200B:100B:1B:::;", "x1:0B:1B"] {
            let result = parse_machine_output(line);
            match line.starts_with('x') {
                true => assert!(result.unwrap().is_empty()),
                false => assert!(matches!(result, Err(Error::ToolOutput { .. })), "{line}"),
            }
        }
    }

    /// In-memory partition table that assigns the lowest free index, like MBR tools do.
    #[derive(Default)]
    struct FakeTable {
        records: RefCell<Vec<PartitionRecord>>,
        /// extra entries to add on the next create, to simulate a misbehaving tool
        phantom: RefCell<Vec<PartitionRecord>>,
        /// when set, create doesn't add anything
        swallow: bool,
    }

    impl PartitionTool for FakeTable {
        fn list(&self, _device: &Path) -> Result<Vec<PartitionRecord>> {
            let mut records = self.records.borrow().clone();
            records.sort_by_key(|r| r.index);
            Ok(records)
        }

        fn scheme(&self, _device: &Path) -> Result<TableScheme> {
            Ok(TableScheme::Msdos)
        }

        fn delete(&self, _device: &Path, index: u32) -> Result<()> {
            self.records.borrow_mut().retain(|r| r.index != index);
            Ok(())
        }

        fn create(&self, _device: &Path, start: u64, end: u64) -> Result<()> {
            if self.swallow {
                return Ok(());
            }
            let mut records = self.records.borrow_mut();
            let index = (1..)
                .find(|i| records.iter().all(|r| r.index != *i))
                .unwrap();
            records.push(PartitionRecord { index, start, end });
            records.extend(self.phantom.borrow_mut().drain(..));
            Ok(())
        }
    }

    fn record(index: u32, start: u64, end: u64) -> PartitionRecord {
        PartitionRecord { index, start, end }
    }

    #[test]
    fn test_create_identified_fills_gap() {
        let table = FakeTable::default();
        *table.records.borrow_mut() = vec![record(1, 0, 10), record(3, 20, 30)];
        let index = create_identified(&table, Path::new("/dev/loop0"), 40, 50).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn test_create_identified_reuses_deleted_index() {
        let table = FakeTable::default();
        *table.records.borrow_mut() = vec![record(1, 0, 10), record(2, 10, 100)];
        table.delete(Path::new("/dev/loop0"), 2).unwrap();
        let index = create_identified(&table, Path::new("/dev/loop0"), 10, 50).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn test_create_identified_nothing_new() {
        let table = FakeTable {
            swallow: true,
            ..Default::default()
        };
        *table.records.borrow_mut() = vec![record(1, 0, 10)];
        match create_identified(&table, Path::new("/dev/loop0"), 10, 20) {
            Err(Error::AmbiguousPartition { found, .. }) => assert!(found.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_create_identified_too_many() {
        let table = FakeTable::default();
        *table.records.borrow_mut() = vec![record(1, 0, 10)];
        table.phantom.borrow_mut().push(record(5, 90, 100));
        match create_identified(&table, Path::new("/dev/loop0"), 10, 20) {
            Err(Error::AmbiguousPartition { found, .. }) => assert_eq!(found, vec![2, 5]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_diff() {
        let before = IndexSnapshot::from_records(&[record(1, 0, 1), record(4, 1, 2)]);
        let after = IndexSnapshot::from_records(&[record(4, 1, 2), record(7, 2, 3)]);
        // index 1 disappearing doesn't count as an addition
        assert_eq!(before.added_index(&after, Path::new("/dev/x")).unwrap(), 7);
    }
}
