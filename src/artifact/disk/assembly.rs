//! Disk assembly: splicing payload files into their partitions.

use super::partitions::Partition;
use crate::error::BuildError;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

const ZERO_CHUNK: usize = 1024 * 1024;

/// One payload destined for one partition.
#[derive(Debug, Clone)]
pub struct PartitionWrite<'a> {
    pub input: &'a Path,
    pub partition: &'a Partition,
    /// Zero the rest of the partition after the payload. Only needed when
    /// the consumer reads past the payload's end; off keeps the disk sparse.
    pub zero_fill: bool,
}

impl<'a> PartitionWrite<'a> {
    pub fn new(input: &'a Path, partition: &'a Partition) -> Self {
        Self {
            input,
            partition,
            zero_fill: false,
        }
    }

    pub fn zero_fill(mut self) -> Self {
        self.zero_fill = true;
        self
    }
}

/// Copy every payload verbatim to its partition's offset in `disk`.
///
/// All payloads are checked before the first byte is written: a payload
/// larger than its partition fails with an overflow and leaves the disk
/// untouched.
pub fn write_partitions(disk: &Path, writes: &[PartitionWrite<'_>]) -> Result<()> {
    let disk_len = fs::metadata(disk)
        .with_context(|| format!("disk image {} not found", disk.display()))?
        .len();

    let mut sizes = Vec::with_capacity(writes.len());
    for w in writes {
        let size = fs::metadata(w.input)
            .with_context(|| format!("payload {} not found", w.input.display()))?
            .len();
        if size > w.partition.size {
            return Err(BuildError::overflow(&w.partition.name, size, w.partition.size).into());
        }
        if w.partition.end() > disk_len {
            bail!(
                "partition '{}' ends at byte {} beyond the {} byte disk",
                w.partition.name,
                w.partition.end(),
                disk_len
            );
        }
        sizes.push(size);
    }

    let mut out = OpenOptions::new()
        .write(true)
        .open(disk)
        .with_context(|| format!("opening {} for writing", disk.display()))?;

    for (w, size) in writes.iter().zip(sizes) {
        out.seek(SeekFrom::Start(w.partition.offset))?;
        let mut input = BufReader::new(
            File::open(w.input).with_context(|| format!("opening {}", w.input.display()))?,
        );
        let copied = copy_bounded(&mut input, &mut out, w.partition)
            .with_context(|| format!("writing {} into '{}'", w.input.display(), w.partition.name))?;
        if copied != size {
            bail!(
                "payload {} changed size while being written ({} != {})",
                w.input.display(),
                copied,
                size
            );
        }

        if w.zero_fill {
            let zeros = vec![0u8; ZERO_CHUNK];
            let mut remaining = w.partition.size - copied;
            while remaining > 0 {
                let n = remaining.min(ZERO_CHUNK as u64) as usize;
                out.write_all(&zeros[..n])?;
                remaining -= n as u64;
            }
        }

        info!(
            partition = %w.partition.name,
            number = w.partition.number,
            offset = w.partition.offset,
            size_bytes = copied,
            "wrote partition payload"
        );
    }

    out.sync_all()?;
    Ok(())
}

/// Copy at most the partition's size; input left over after that is an
/// overflow, so a payload that grows mid-write never reaches the next
/// partition or the backup GPT.
fn copy_bounded<R: Read, W: Write>(input: &mut R, out: &mut W, partition: &Partition) -> Result<u64> {
    let copied = io::copy(&mut input.by_ref().take(partition.size), out)?;
    let mut extra = [0u8; 1];
    if input.read(&mut extra)? > 0 {
        return Err(BuildError::overflow(&partition.name, copied + 1, partition.size).into());
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::super::gpt::create_disk;
    use super::super::partitions::{plan, DiskPlan, PartitionSpec, PartitionType, SizeHint};
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn disk_with(tmp: &TempDir, linux_size: u64) -> (std::path::PathBuf, DiskPlan) {
        let plan = plan(
            None,
            &[
                PartitionSpec::new("grub", SizeHint::Bytes(MIB), PartitionType::BiosBoot),
                PartitionSpec::new("linux", SizeHint::Bytes(linux_size), PartitionType::LinuxData),
            ],
        )
        .unwrap();
        let disk = tmp.path().join("disk.img");
        create_disk(&disk, &plan, "test").unwrap();
        (disk, plan)
    }

    /// Sparse payload with recognisable first and last bytes.
    fn payload(path: &Path, size: u64) {
        let mut f = File::create(path).unwrap();
        f.set_len(size).unwrap();
        f.write_all(b"HEAD").unwrap();
        f.seek(SeekFrom::Start(size - 4)).unwrap();
        f.write_all(b"TAIL").unwrap();
    }

    fn read_range(path: &Path, offset: u64, len: usize) -> Vec<u8> {
        let mut f = File::open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn payload_fits_exactly_sized_partition() {
        let tmp = TempDir::new().unwrap();
        let (disk, plan) = disk_with(&tmp, 50 * MIB);
        let squashfs = tmp.path().join("squashfs.img");
        payload(&squashfs, 50 * MIB);

        let linux = plan.by_name("linux").unwrap();
        write_partitions(&disk, &[PartitionWrite::new(&squashfs, linux)]).unwrap();

        assert_eq!(read_range(&disk, linux.offset, 4), b"HEAD");
        assert_eq!(read_range(&disk, linux.end() - 4, 4), b"TAIL");
    }

    #[test]
    fn oversized_payload_is_overflow_and_disk_untouched() {
        let tmp = TempDir::new().unwrap();
        let (disk, plan) = disk_with(&tmp, 49 * MIB);
        let before = fs::read(&disk).unwrap();

        let small = tmp.path().join("core.img");
        payload(&small, 4096);
        let squashfs = tmp.path().join("squashfs.img");
        payload(&squashfs, 50 * MIB);

        let err = write_partitions(
            &disk,
            &[
                PartitionWrite::new(&small, plan.by_name("grub").unwrap()),
                PartitionWrite::new(&squashfs, plan.by_name("linux").unwrap()),
            ],
        )
        .unwrap_err();

        match crate::error::classify(&err) {
            Some(BuildError::Overflow {
                target,
                needed,
                capacity,
            }) => {
                assert_eq!(target, "linux");
                assert_eq!(*needed, 50 * MIB);
                assert_eq!(*capacity, 49 * MIB);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(fs::read(&disk).unwrap() == before, "disk was modified");
    }

    #[test]
    fn trailing_bytes_untouched_unless_zero_filled() {
        let tmp = TempDir::new().unwrap();
        let (disk, plan) = disk_with(&tmp, 2 * MIB);
        let linux = plan.by_name("linux").unwrap().clone();

        let junk = tmp.path().join("junk");
        fs::write(&junk, vec![0xAA; (2 * MIB) as usize]).unwrap();
        write_partitions(&disk, &[PartitionWrite::new(&junk, &linux)]).unwrap();

        let short = tmp.path().join("short");
        fs::write(&short, b"data").unwrap();
        write_partitions(&disk, &[PartitionWrite::new(&short, &linux)]).unwrap();
        assert_eq!(read_range(&disk, linux.offset, 6), b"data\xAA\xAA");

        write_partitions(&disk, &[PartitionWrite::new(&short, &linux).zero_fill()]).unwrap();
        let tail = read_range(&disk, linux.offset + 4, (linux.size - 4) as usize);
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_stops_at_the_partition_end() {
        let plan = plan(
            None,
            &[PartitionSpec::new("root", SizeHint::Bytes(4096), PartitionType::LinuxData)],
        )
        .unwrap();
        let root = plan.by_name("root").unwrap();

        let mut grown = Cursor::new(vec![0x5Au8; 4096 + 512]);
        let mut out = Cursor::new(Vec::new());
        let err = copy_bounded(&mut grown, &mut out, root).unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Overflow { target, capacity, .. }) => {
                assert_eq!(target, "root");
                assert_eq!(*capacity, 4096);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert_eq!(out.into_inner().len(), 4096);

        let mut exact = Cursor::new(vec![0x5Au8; 4096]);
        let mut out = Cursor::new(Vec::new());
        assert_eq!(copy_bounded(&mut exact, &mut out, root).unwrap(), 4096);
    }
}
