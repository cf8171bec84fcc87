//! Partition planning.
//!
//! Partitions are laid out in the given order starting at LBA 2048 (1 MiB).
//! Every start is rounded up to 1 MiB and every size up to a whole sector.
//! Declared sizes are authoritative: the planner never shrinks a partition
//! to fit, it reports an overflow instead.

use crate::error::BuildError;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;
pub const ALIGNMENT: u64 = 1024 * 1024;
pub const FIRST_PARTITION_LBA: u64 = ALIGNMENT / SECTOR_SIZE;

/// Entry array (32 sectors) plus header: the size of the backup GPT.
pub const GPT_RESERVED_SECTORS: u64 = 33;

/// GPT partition names are at most 36 UTF-16 code units.
const MAX_NAME_UNITS: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    BiosBoot,
    LinuxData,
    EfiSystem,
}

impl PartitionType {
    pub fn type_guid(&self) -> Uuid {
        match self {
            PartitionType::BiosBoot => {
                Uuid::from_u128(0x21686148_6449_6E6F_744E_656564454649)
            }
            PartitionType::LinuxData => {
                Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4)
            }
            PartitionType::EfiSystem => {
                Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B)
            }
        }
    }

    pub fn from_type_guid(guid: &Uuid) -> Option<Self> {
        [
            PartitionType::BiosBoot,
            PartitionType::LinuxData,
            PartitionType::EfiSystem,
        ]
        .into_iter()
        .find(|t| t.type_guid() == *guid)
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionType::BiosBoot => "bios-boot",
            PartitionType::LinuxData => "linux-data",
            PartitionType::EfiSystem => "efi-system",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    Bytes(u64),
    /// Whatever is left of the disk budget. Final partition only.
    Remaining,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub size: SizeHint,
    pub kind: PartitionType,
}

impl PartitionSpec {
    pub fn new(name: impl Into<String>, size: SizeHint, kind: PartitionType) -> Self {
        Self {
            name: name.into(),
            size,
            kind,
        }
    }
}

/// A planned partition. `number` is 1-based, as in `/dev/sda1` and `(hd0,1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub name: String,
    pub kind: PartitionType,
    pub offset: u64,
    pub size: u64,
}

impl Partition {
    pub fn first_lba(&self) -> u64 {
        self.offset / SECTOR_SIZE
    }

    /// Inclusive, as stored in the GPT entry.
    pub fn last_lba(&self) -> u64 {
        (self.end() / SECTOR_SIZE).saturating_sub(1)
    }

    pub fn sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// Exclusive end offset. [`plan`] never produces a partition whose end
    /// overflows.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPlan {
    pub partitions: Vec<Partition>,
    pub disk_size: u64,
}

impl DiskPlan {
    pub fn total_sectors(&self) -> u64 {
        self.disk_size / SECTOR_SIZE
    }

    pub fn partition(&self, number: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.number == number)
    }

    pub fn by_name(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_next_multiple_of(alignment)
}

fn config_error(msg: String) -> anyhow::Error {
    BuildError::Configuration(msg).into()
}

/// Lay out `specs` in order.
///
/// With a budget the disk is exactly `budget` bytes and everything must fit
/// inside it (backup GPT included); without one the disk ends right after
/// the backup GPT following the last aligned partition.
pub fn plan(budget: Option<u64>, specs: &[PartitionSpec]) -> Result<DiskPlan> {
    if specs.is_empty() {
        return Err(config_error("disk layout has no partitions".into()));
    }
    if let Some(budget) = budget {
        if budget % SECTOR_SIZE != 0 {
            return Err(config_error(format!(
                "disk size {} is not a multiple of {} bytes",
                budget, SECTOR_SIZE
            )));
        }
    }

    let mut seen = BTreeSet::new();
    for (i, spec) in specs.iter().enumerate() {
        if spec.name.is_empty() || spec.name.encode_utf16().count() > MAX_NAME_UNITS {
            return Err(config_error(format!(
                "partition name '{}' must be 1 to {} characters",
                spec.name, MAX_NAME_UNITS
            )));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(config_error(format!("duplicate partition name '{}'", spec.name)));
        }
        match spec.size {
            SizeHint::Bytes(0) => {
                return Err(config_error(format!("partition '{}' has size 0", spec.name)))
            }
            SizeHint::Remaining if i + 1 != specs.len() => {
                return Err(config_error(format!(
                    "partition '{}' uses the remaining space but is not the last partition",
                    spec.name
                )))
            }
            SizeHint::Remaining if budget.is_none() => {
                return Err(config_error(format!(
                    "partition '{}' uses the remaining space but no disk size is set",
                    spec.name
                )))
            }
            _ => {}
        }
    }

    // Sizes come straight from recipes; a layout past u64 cannot fit any disk.
    let too_large = || -> anyhow::Error {
        match budget {
            Some(budget) => BuildError::overflow("disk", u64::MAX, budget).into(),
            None => config_error("partition layout exceeds the largest possible disk".into()),
        }
    };

    let backup = GPT_RESERVED_SECTORS * SECTOR_SIZE;
    let mut cursor = FIRST_PARTITION_LBA * SECTOR_SIZE;
    let mut partitions = Vec::with_capacity(specs.len());

    for (i, spec) in specs.iter().enumerate() {
        let offset = align_up(cursor, ALIGNMENT).ok_or_else(too_large)?;
        let size = match (spec.size, budget) {
            (SizeHint::Bytes(n), _) => align_up(n, SECTOR_SIZE).ok_or_else(too_large)?,
            (SizeHint::Remaining, Some(budget)) => {
                let limit = budget.saturating_sub(backup);
                let first = offset.checked_add(SECTOR_SIZE).ok_or_else(too_large)?;
                if first > limit {
                    return Err(BuildError::overflow("disk", first.saturating_add(backup), budget).into());
                }
                (limit - offset) / SECTOR_SIZE * SECTOR_SIZE
            }
            (SizeHint::Remaining, None) => bail!("remaining size without a disk budget"),
        };
        partitions.push(Partition {
            number: i as u32 + 1,
            name: spec.name.clone(),
            kind: spec.kind,
            offset,
            size,
        });
        cursor = offset.checked_add(size).ok_or_else(too_large)?;
    }

    let disk_size = match budget {
        Some(budget) => {
            let needed = cursor.checked_add(backup).ok_or_else(too_large)?;
            if needed > budget {
                return Err(BuildError::overflow("disk", needed, budget).into());
            }
            budget
        }
        None => align_up(cursor, ALIGNMENT)
            .and_then(|end| end.checked_add(backup))
            .ok_or_else(too_large)?,
    };

    Ok(DiskPlan {
        partitions,
        disk_size,
    })
}

/// Byte size such as `4096`, `512K`, `50M`, `2G` (binary units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (digits, multiplier) = match s.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => {
                let multiplier = match c.to_ascii_uppercase() {
                    'K' => 1u64 << 10,
                    'M' => 1 << 20,
                    'G' => 1 << 30,
                    'T' => 1 << 40,
                    _ => bail!("unknown size suffix in '{}'", s),
                };
                (&s[..i], multiplier)
            }
            _ => (s, 1),
        };
        let n: u64 = digits
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid size '{}'", s))?;
        n.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| anyhow::anyhow!("size '{}' is too large", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn spec(name: &str, size: SizeHint, kind: PartitionType) -> PartitionSpec {
        PartitionSpec::new(name, size, kind)
    }

    #[test]
    fn partitions_are_aligned_and_contiguous() {
        let plan = plan(
            None,
            &[
                spec("grub", SizeHint::Bytes(30_000), PartitionType::BiosBoot),
                spec("linux", SizeHint::Bytes(50 * MIB + 1), PartitionType::LinuxData),
            ],
        )
        .unwrap();

        let grub = &plan.partitions[0];
        assert_eq!(grub.number, 1);
        assert_eq!(grub.offset, MIB);
        assert_eq!(grub.first_lba(), 2048);
        assert_eq!(grub.size, 30_208);

        let linux = &plan.partitions[1];
        assert_eq!(linux.number, 2);
        assert_eq!(linux.offset, 2 * MIB);
        assert_eq!(linux.size, 50 * MIB + 512);

        // Aligned end of the last partition plus the backup GPT.
        assert_eq!(plan.disk_size, 53 * MIB + 33 * 512);
    }

    #[test]
    fn remaining_fills_the_budget() {
        let budget = 64 * MIB;
        let plan = plan(
            Some(budget),
            &[
                spec("grub", SizeHint::Bytes(MIB), PartitionType::BiosBoot),
                spec("data", SizeHint::Remaining, PartitionType::LinuxData),
            ],
        )
        .unwrap();
        assert_eq!(plan.disk_size, budget);
        let data = plan.by_name("data").unwrap();
        assert_eq!(data.offset, 2 * MIB);
        assert_eq!(data.end(), budget - 33 * 512);
    }

    #[test]
    fn exceeding_budget_is_overflow() {
        let err = plan(
            Some(8 * MIB),
            &[spec("linux", SizeHint::Bytes(8 * MIB), PartitionType::LinuxData)],
        )
        .unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Overflow { target, .. }) => assert_eq!(target, "disk"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn remaining_must_be_last_and_budgeted() {
        let not_last = plan(
            Some(64 * MIB),
            &[
                spec("a", SizeHint::Remaining, PartitionType::LinuxData),
                spec("b", SizeHint::Bytes(MIB), PartitionType::LinuxData),
            ],
        );
        assert!(not_last.is_err());

        let unbudgeted = plan(None, &[spec("a", SizeHint::Remaining, PartitionType::LinuxData)]);
        assert!(matches!(
            crate::error::classify(&unbudgeted.unwrap_err()),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = plan(
            None,
            &[
                spec("root", SizeHint::Bytes(MIB), PartitionType::LinuxData),
                spec("root", SizeHint::Bytes(MIB), PartitionType::LinuxData),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn type_guids_roundtrip() {
        assert_eq!(
            PartitionType::BiosBoot.type_guid().to_string(),
            "21686148-6449-6e6f-744e-656564454649"
        );
        assert_eq!(
            PartitionType::from_type_guid(&PartitionType::LinuxData.type_guid()),
            Some(PartitionType::LinuxData)
        );
    }

    #[test]
    fn byte_sizes_parse() {
        assert_eq!("4096".parse::<ByteSize>().unwrap(), ByteSize(4096));
        assert_eq!("512K".parse::<ByteSize>().unwrap(), ByteSize(512 * 1024));
        assert_eq!("50M".parse::<ByteSize>().unwrap(), ByteSize(50 * MIB));
        assert_eq!("2g".parse::<ByteSize>().unwrap(), ByteSize(2 << 30));
        assert!("12Q".parse::<ByteSize>().is_err());
        assert!("M".parse::<ByteSize>().is_err());
    }

    #[test]
    fn sizes_near_u64_max_are_errors_not_panics() {
        let huge = [
            spec("grub", SizeHint::Bytes(MIB), PartitionType::BiosBoot),
            spec("linux", SizeHint::Bytes(u64::MAX - 100), PartitionType::LinuxData),
        ];
        let err = plan(None, &huge).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(BuildError::Configuration(_))
        ));

        let err = plan(Some(1024 * MIB), &huge).unwrap_err();
        match crate::error::classify(&err) {
            Some(BuildError::Overflow { target, capacity, .. }) => {
                assert_eq!(target, "disk");
                assert_eq!(*capacity, 1024 * MIB);
            }
            other => panic!("expected overflow, got {other:?}"),
        }

        let two_big = [
            spec("a", SizeHint::Bytes(u64::MAX / 2), PartitionType::LinuxData),
            spec("b", SizeHint::Bytes(u64::MAX / 2), PartitionType::LinuxData),
        ];
        assert!(plan(None, &two_big).is_err());
    }
}
