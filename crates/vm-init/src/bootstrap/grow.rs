//! Grow the root partition and its filesystem into the whole disk.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor, stat};
use tracing::{debug, info};

use super::gpt::{Gpt, Growth};
use crate::command;
use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::Fs;
use crate::reaper::Reaper;

/// The block device holding `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDevice {
    /// e.g. `nvme0n1p1`
    pub partition: String,
    /// e.g. `nvme0n1`
    pub disk: String,
    /// 1-based partition number.
    pub number: u32,
}

impl RootDevice {
    /// Build from the `uevent` of the root device. `None` when the root is
    /// not a partition.
    pub fn from_uevent(uevent: &str) -> Option<Self> {
        let mut devname = None;
        let mut number = None;
        for line in uevent.lines() {
            match line.split_once('=') {
                Some(("DEVNAME", v)) => devname = Some(v.trim()),
                Some(("PARTN", v)) => number = v.trim().parse().ok(),
                _ => {}
            }
        }
        let partition = devname?.to_string();
        let disk = disk_of(&partition)?;
        Some(Self {
            disk,
            partition,
            number: number?,
        })
    }

    pub fn find(fs: &dyn Fs) -> Result<Option<Self>> {
        let st = stat("/").map_err(InitError::sys("stat", "/"))?;
        let uevent_path = Path::new(paths::SYS_DEV_BLOCK)
            .join(format!("{}:{}", major(st.st_dev), minor(st.st_dev)))
            .join("uevent");
        let uevent = fs
            .read_to_string(&uevent_path)
            .map_err(InitError::io(&uevent_path))?;
        Ok(Self::from_uevent(&uevent))
    }
}

/// `nvme0n1p1` -> `nvme0n1`, `xvda1` -> `xvda`.
fn disk_of(partition: &str) -> Option<String> {
    let base = partition.trim_end_matches(|c: char| c.is_ascii_digit());
    if base.len() == partition.len() {
        return None;
    }
    let base = match base.strip_suffix('p') {
        Some(stripped) if stripped.ends_with(|c: char| c.is_ascii_digit()) => stripped,
        _ => base,
    };
    (!base.is_empty()).then(|| base.to_string())
}

fn read_sysfs_u64(fs: &dyn Fs, path: &Path) -> Result<u64> {
    let raw = fs.read_to_string(path).map_err(InitError::io(path))?;
    raw.trim().parse().map_err(|e| {
        InitError::io(path)(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Rewrite the primary and backup tables so partition `number` reaches the
/// end of the disk. `total_sectors` is in units of `block_size`.
pub fn rewrite_table(
    disk: &File,
    number: u32,
    total_sectors: u64,
    block_size: u64,
) -> Result<Option<Growth>> {
    let io = |e| InitError::io("partition table")(e);
    let mut header = vec![0u8; block_size as usize];
    disk.read_exact_at(&mut header, block_size).map_err(io)?;
    let array = Gpt::entry_array(&header)?;
    let mut entries = vec![0u8; array.len];
    disk.read_exact_at(&mut entries, array.lba * block_size)
        .map_err(io)?;

    let mut gpt = Gpt::parse(&header, &entries, block_size)?;
    let Some(growth) = gpt.grow(number, total_sectors)? else {
        return Ok(None);
    };

    disk.write_all_at(gpt.entries(), gpt.primary_entries_lba() * block_size)
        .map_err(io)?;
    disk.write_all_at(gpt.primary_header(), block_size)
        .map_err(io)?;
    disk.write_all_at(gpt.entries(), gpt.backup_entries_lba() * block_size)
        .map_err(io)?;
    disk.write_all_at(&gpt.backup_header(), gpt.backup_header_lba() * block_size)
        .map_err(io)?;
    disk.sync_all().map_err(io)?;
    Ok(Some(growth))
}

#[repr(C)]
struct BlkpgPartition {
    start: i64,
    length: i64,
    pno: libc::c_int,
    devname: [libc::c_char; 64],
    volname: [libc::c_char; 64],
}

#[repr(C)]
struct BlkpgIoctlArg {
    op: libc::c_int,
    flags: libc::c_int,
    datalen: libc::c_int,
    data: *mut libc::c_void,
}

const BLKPG: u32 = 0x1269;
const BLKPG_RESIZE_PARTITION: libc::c_int = 3;

nix::ioctl_write_ptr_bad!(blkpg, BLKPG, BlkpgIoctlArg);

/// Tell the kernel about the new partition size without a re-read.
fn resize_kernel_partition(disk: &File, number: u32, growth: Growth, block_size: u64) -> Result<()> {
    let bytes = |sectors: u64| i64::try_from(sectors * block_size).unwrap_or(i64::MAX);
    let mut part = BlkpgPartition {
        start: bytes(growth.first_lba),
        length: bytes(growth.new_last_lba - growth.first_lba + 1),
        pno: libc::c_int::try_from(number).unwrap_or(libc::c_int::MAX),
        devname: [0; 64],
        volname: [0; 64],
    };
    let arg = BlkpgIoctlArg {
        op: BLKPG_RESIZE_PARTITION,
        flags: 0,
        datalen: std::mem::size_of::<BlkpgPartition>() as libc::c_int,
        data: (&raw mut part).cast(),
    };
    // SAFETY: `arg` and the partition it points at live across the call and
    // match the kernel's `struct blkpg_ioctl_arg` / `struct blkpg_partition`.
    unsafe { blkpg(disk.as_raw_fd(), &arg) }
        .map_err(InitError::sys("ioctl(BLKPG_RESIZE_PARTITION)", number))?;
    Ok(())
}

/// Grow the root partition to fill its disk, then grow the filesystem.
pub async fn grow_root(fs: &dyn Fs, reaper: &Reaper) -> Result<()> {
    let Some(root) = RootDevice::find(fs)? else {
        debug!("root is not on a partition, not growing");
        return Ok(());
    };
    let sys_disk = Path::new(paths::SYS_BLOCK).join(&root.disk);
    let block_size = read_sysfs_u64(fs, &sys_disk.join("queue/logical_block_size"))?;
    // sysfs reports the size in 512-byte sectors regardless of block size.
    let total_sectors = read_sysfs_u64(fs, &sys_disk.join("size"))? * 512 / block_size.max(1);

    let disk_path: PathBuf = Path::new(paths::DEV).join(&root.disk);
    let number = root.number;
    let growth = tokio::task::spawn_blocking(move || -> Result<Option<Growth>> {
        let disk = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&disk_path)
            .map_err(InitError::io(&disk_path))?;
        let growth = rewrite_table(&disk, number, total_sectors, block_size)?;
        if let Some(growth) = growth {
            resize_kernel_partition(&disk, number, growth, block_size)?;
        }
        Ok(growth)
    })
    .await??;

    match growth {
        Some(g) => info!(
            partition = root.partition,
            from = g.old_last_lba,
            to = g.new_last_lba,
            "grew root partition"
        ),
        None => debug!(partition = root.partition, "root partition already fills the disk"),
    }

    let partition = Path::new(paths::DEV).join(&root.partition);
    command::exec(reaper, paths::RESIZE2FS, &[partition]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_device_from_uevent() {
        let uevent = "MAJOR=259\nMINOR=1\nDEVNAME=nvme0n1p1\nDEVTYPE=partition\nPARTN=1\n";
        assert_eq!(
            RootDevice::from_uevent(uevent),
            Some(RootDevice {
                partition: "nvme0n1p1".into(),
                disk: "nvme0n1".into(),
                number: 1,
            })
        );
        assert_eq!(RootDevice::from_uevent("DEVNAME=nvme0n1\nDEVTYPE=disk\n"), None);
    }

    #[test]
    fn disk_names() {
        assert_eq!(disk_of("xvda1").as_deref(), Some("xvda"));
        assert_eq!(disk_of("vda15").as_deref(), Some("vda"));
        assert_eq!(disk_of("nvme0n1p2").as_deref(), Some("nvme0n1"));
        assert_eq!(disk_of("mmcblk0p1").as_deref(), Some("mmcblk0"));
        assert_eq!(disk_of("sda").as_deref(), None);
    }

    /// Write a GPT for a disk of `total` 512-byte sectors whose single
    /// partition ends at the last usable sector.
    fn write_image(file: &File, total: u64) {
        let entries_len = 128 * 128;
        let last_usable = total - 34;
        let mut entries = vec![0u8; entries_len];
        entries[..16].fill(0xAF);
        entries[32..40].copy_from_slice(&2048u64.to_le_bytes());
        entries[40..48].copy_from_slice(&last_usable.to_le_bytes());

        let mut header = vec![0u8; 512];
        header[..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes());
        header[32..40].copy_from_slice(&(total - 1).to_le_bytes());
        header[40..48].copy_from_slice(&34u64.to_le_bytes());
        header[48..56].copy_from_slice(&last_usable.to_le_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&128u32.to_le_bytes());
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        header[88..92].copy_from_slice(&crc32fast::hash(&entries).to_le_bytes());
        let crc = crc32fast::hash(&header[..92]);
        header[16..20].copy_from_slice(&crc.to_le_bytes());

        file.write_all_at(&header, 512).unwrap();
        file.write_all_at(&entries, 1024).unwrap();
    }

    #[test]
    fn table_rewrite_writes_both_copies() {
        let file = tempfile::tempfile().unwrap();
        write_image(&file, 4096);
        file.set_len(8192 * 512).unwrap();

        let growth = rewrite_table(&file, 1, 8192, 512).unwrap().unwrap();
        assert_eq!(growth.new_last_lba, 8192 - 34);

        let mut primary = vec![0u8; 512];
        file.read_exact_at(&mut primary, 512).unwrap();
        let mut backup = vec![0u8; 512];
        file.read_exact_at(&mut backup, 8191 * 512).unwrap();

        let backup_array = Gpt::entry_array(&backup).unwrap();
        assert_eq!(backup_array.lba, 8191 - 32);
        let mut backup_entries = vec![0u8; backup_array.len];
        file.read_exact_at(&mut backup_entries, backup_array.lba * 512)
            .unwrap();

        let from_primary = {
            let array = Gpt::entry_array(&primary).unwrap();
            let mut entries = vec![0u8; array.len];
            file.read_exact_at(&mut entries, array.lba * 512).unwrap();
            Gpt::parse(&primary, &entries, 512).unwrap()
        };
        assert_eq!(from_primary.partition(1), Some((2048, 8158)));
        assert_eq!(from_primary.entries(), backup_entries.as_slice());

        // Second pass finds nothing to do.
        assert_eq!(rewrite_table(&file, 1, 8192, 512).unwrap(), None);
    }
}
