//! GUID partition table writer and reader.
//!
//! Writes a protective MBR, the primary header and entry array at LBA 1-33
//! and the backup copies at the end of the disk. Disk and partition GUIDs
//! are derived from the disk label and partition names, so the same plan
//! always produces the same bytes.

use super::partitions::{DiskPlan, PartitionType, GPT_RESERVED_SECTORS, SECTOR_SIZE};
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use uuid::Uuid;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
const ENTRY_COUNT: u32 = 128;
const ENTRY_SIZE: u32 = 128;
const ENTRY_ARRAY_BYTES: usize = (ENTRY_COUNT * ENTRY_SIZE) as usize;

/// Offset of the first MBR partition record.
const MBR_PARTITION_TABLE: usize = 0x1BE;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

/// CRC-32 (IEEE 802.3, reflected), as used by GPT.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Stable GUID for `parts`, shaped as a random (v4) UUID.
pub fn derived_guid(parts: &[&str]) -> Uuid {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// One decoded partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub number: u32,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl GptEntry {
    pub fn kind(&self) -> Option<PartitionType> {
        PartitionType::from_type_guid(&self.type_guid)
    }
}

#[derive(Debug, Clone)]
pub struct GptTable {
    pub disk_guid: Uuid,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub entries: Vec<GptEntry>,
}

fn entry_array(plan: &DiskPlan, label: &str) -> Vec<u8> {
    let mut entries = vec![0u8; ENTRY_ARRAY_BYTES];
    for (i, part) in plan.partitions.iter().enumerate() {
        let e = &mut entries[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize];
        e[0..16].copy_from_slice(&part.kind.type_guid().to_bytes_le());
        e[16..32].copy_from_slice(&derived_guid(&[label, &part.name]).to_bytes_le());
        e[32..40].copy_from_slice(&part.first_lba().to_le_bytes());
        e[40..48].copy_from_slice(&part.last_lba().to_le_bytes());
        // Attributes (48..56) stay zero.
        for (j, unit) in part.name.encode_utf16().take(36).enumerate() {
            e[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    entries
}

fn header(
    plan: &DiskPlan,
    label: &str,
    my_lba: u64,
    alternate_lba: u64,
    entries_lba: u64,
    entries_crc: u32,
) -> [u8; SECTOR_SIZE as usize] {
    let total = plan.total_sectors();
    let mut h = [0u8; SECTOR_SIZE as usize];
    h[0..8].copy_from_slice(SIGNATURE);
    h[8..12].copy_from_slice(&REVISION.to_le_bytes());
    h[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
    // 16..20 header CRC, filled below; 20..24 reserved.
    h[24..32].copy_from_slice(&my_lba.to_le_bytes());
    h[32..40].copy_from_slice(&alternate_lba.to_le_bytes());
    h[40..48].copy_from_slice(&(1 + GPT_RESERVED_SECTORS).to_le_bytes());
    h[48..56].copy_from_slice(&(total - 1 - GPT_RESERVED_SECTORS).to_le_bytes());
    h[56..72].copy_from_slice(&derived_guid(&[label]).to_bytes_le());
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&ENTRY_COUNT.to_le_bytes());
    h[84..88].copy_from_slice(&ENTRY_SIZE.to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32(&h[..HEADER_SIZE as usize]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

fn protective_mbr(total_sectors: u64) -> [u8; SECTOR_SIZE as usize] {
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    let rec = &mut mbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + 16];
    rec[0] = 0x00;
    rec[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
    rec[4] = MBR_PROTECTIVE_TYPE;
    rec[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    rec[8..12].copy_from_slice(&1u32.to_le_bytes());
    let size = (total_sectors - 1).min(u32::MAX as u64) as u32;
    rec[12..16].copy_from_slice(&size.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Create a fresh sparse disk image at `path` holding `plan`'s table.
///
/// An existing file is replaced, never updated in place.
pub fn create_disk(path: &Path, plan: &DiskPlan, label: &str) -> Result<()> {
    let total = plan.total_sectors();
    if total < 2 * (GPT_RESERVED_SECTORS + 1) + 1 {
        bail!("disk of {} bytes is too small for a GPT", plan.disk_size);
    }
    if plan.partitions.len() > ENTRY_COUNT as usize {
        bail!("GPT holds at most {} partitions", ENTRY_COUNT);
    }

    if path.exists() {
        fs::remove_file(path).with_context(|| format!("removing old {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)
        .with_context(|| format!("creating disk image {}", path.display()))?;
    file.set_len(plan.disk_size)?;

    let entries = entry_array(plan, label);
    let entries_crc = crc32(&entries);
    let last_lba = total - 1;
    let backup_entries_lba = last_lba - (GPT_RESERVED_SECTORS - 1);

    let primary = header(plan, label, 1, last_lba, 2, entries_crc);
    let backup = header(plan, label, last_lba, 1, backup_entries_lba, entries_crc);

    file.write_all(&protective_mbr(total))?;
    file.write_all(&primary)?;
    file.write_all(&entries)?;
    file.seek(SeekFrom::Start(backup_entries_lba * SECTOR_SIZE))?;
    file.write_all(&entries)?;
    file.write_all(&backup)?;
    file.sync_all()?;
    Ok(())
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}

fn le_u32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

fn guid(b: &[u8]) -> Uuid {
    let mut a = [0u8; 16];
    a.copy_from_slice(&b[..16]);
    Uuid::from_bytes_le(a)
}

/// Read and verify the primary GPT of `path`.
pub fn read_partition_table(path: &Path) -> Result<GptTable> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut h = [0u8; SECTOR_SIZE as usize];
    read_at(&mut file, SECTOR_SIZE, &mut h)?;
    if &h[0..8] != SIGNATURE {
        bail!("{} has no GPT signature", path.display());
    }
    let header_size = le_u32(&h[12..16]) as usize;
    if header_size != HEADER_SIZE as usize {
        bail!("unsupported GPT header size {}", header_size);
    }
    let stored_crc = le_u32(&h[16..20]);
    let mut check = h;
    check[16..20].fill(0);
    if crc32(&check[..header_size]) != stored_crc {
        bail!("GPT header CRC mismatch in {}", path.display());
    }

    let entries_lba = le_u64(&h[72..80]);
    let count = le_u32(&h[80..84]) as usize;
    let size = le_u32(&h[84..88]) as usize;
    if size < 128 || count * size > 1024 * 1024 {
        bail!("implausible GPT entry array ({} x {})", count, size);
    }
    let mut entries = vec![0u8; count * size];
    read_at(&mut file, entries_lba * SECTOR_SIZE, &mut entries)?;
    if crc32(&entries) != le_u32(&h[88..92]) {
        bail!("GPT entry array CRC mismatch in {}", path.display());
    }

    let mut out = Vec::new();
    for i in 0..count {
        let e = &entries[i * size..(i + 1) * size];
        let type_guid = guid(&e[0..16]);
        if type_guid.is_nil() {
            continue;
        }
        let units: Vec<u16> = e[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        out.push(GptEntry {
            number: i as u32 + 1,
            type_guid,
            unique_guid: guid(&e[16..32]),
            first_lba: le_u64(&e[32..40]),
            last_lba: le_u64(&e[40..48]),
            name: String::from_utf16_lossy(&units),
        });
    }

    Ok(GptTable {
        disk_guid: guid(&h[56..72]),
        first_usable_lba: le_u64(&h[40..48]),
        last_usable_lba: le_u64(&h[48..56]),
        entries: out,
    })
}

#[cfg(test)]
mod tests {
    use super::super::partitions::{plan, PartitionSpec, SizeHint};
    use super::*;
    use tempfile::TempDir;

    fn sample_plan() -> DiskPlan {
        plan(
            None,
            &[
                PartitionSpec::new("grub", SizeHint::Bytes(64 * 1024), PartitionType::BiosBoot),
                PartitionSpec::new("linux", SizeHint::Bytes(4 << 20), PartitionType::LinuxData),
            ],
        )
        .unwrap()
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn derived_guid_is_stable_v4() {
        let a = derived_guid(&["qemu", "linux"]);
        assert_eq!(a, derived_guid(&["qemu", "linux"]));
        assert_ne!(a, derived_guid(&["qemu", "grub"]));
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn written_table_reads_back() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.img");
        let plan = sample_plan();
        create_disk(&disk, &plan, "qemu").unwrap();

        assert_eq!(fs::metadata(&disk).unwrap().len(), plan.disk_size);
        let table = read_partition_table(&disk).unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[0].name, "grub");
        assert_eq!(table.entries[0].kind(), Some(PartitionType::BiosBoot));
        assert_eq!(table.entries[1].first_lba, plan.partitions[1].first_lba());
        assert_eq!(table.entries[1].last_lba, plan.partitions[1].last_lba());
        assert!(table.last_usable_lba >= plan.partitions[1].last_lba());

        let bytes = fs::read(&disk).unwrap();
        assert_eq!(&bytes[510..512], &[0x55, 0xAA]);
        assert_eq!(bytes[0x1BE + 4], 0xEE);
        let last = bytes.len() - 512;
        assert_eq!(&bytes[last..last + 8], SIGNATURE);
    }

    #[test]
    fn output_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.img");
        let b = tmp.path().join("b.img");
        create_disk(&a, &sample_plan(), "qemu").unwrap();
        create_disk(&b, &sample_plan(), "qemu").unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn existing_file_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.img");
        fs::write(&disk, vec![0xAB; 8 << 20]).unwrap();
        let plan = sample_plan();
        create_disk(&disk, &plan, "qemu").unwrap();

        let bytes = fs::read(&disk).unwrap();
        assert_eq!(bytes.len() as u64, plan.disk_size);
        let p = &plan.partitions[1];
        assert!(bytes[p.offset as usize..p.end() as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn corrupted_header_is_detected() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.img");
        create_disk(&disk, &sample_plan(), "qemu").unwrap();

        let mut f = OpenOptions::new().write(true).open(&disk).unwrap();
        f.seek(SeekFrom::Start(512 + 40)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        drop(f);
        assert!(read_partition_table(&disk).is_err());
    }
}
