//! NVMe Identify Controller, used to recover the device name a cloud
//! block-storage volume was attached as.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{InitError, Result};

const IDENTIFY_LEN: usize = 4096;
const OPCODE_IDENTIFY: u8 = 0x06;
const CNS_CONTROLLER: u32 = 1;

const MODEL: std::ops::Range<usize> = 24..64;
/// Vendor-specific area holding the requested block-device name.
const VENDOR_DEVICE_NAME: std::ops::Range<usize> = 3072..3104;
const EBS_MODEL: &str = "Amazon Elastic Block Store";

/// `struct nvme_admin_cmd` from `<linux/nvme_ioctl.h>`.
#[repr(C)]
#[derive(Debug, Default)]
struct AdminCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    result: u32,
}

// NVME_IOCTL_ADMIN_CMD = _IOWR('N', 0x41, struct nvme_admin_cmd)
nix::ioctl_readwrite!(nvme_admin_cmd, b'N', 0x41, AdminCmd);

/// Issue Identify Controller against `device` and return the requested
/// device name if it is a cloud block-storage volume.
pub fn identify_ebs(device: &Path) -> Result<Option<String>> {
    let file = File::open(device).map_err(InitError::io(device))?;
    let mut data = vec![0u8; IDENTIFY_LEN];
    let mut cmd = AdminCmd {
        opcode: OPCODE_IDENTIFY,
        addr: data.as_mut_ptr() as u64,
        data_len: IDENTIFY_LEN as u32,
        cdw10: CNS_CONTROLLER,
        ..Default::default()
    };
    // SAFETY: `cmd` matches the kernel layout and `addr` points at a live
    // buffer of `data_len` bytes that outlives the call.
    unsafe { nvme_admin_cmd(file.as_raw_fd(), &mut cmd) }
        .map_err(InitError::sys("ioctl(NVME_IOCTL_ADMIN_CMD)", device.display()))?;
    Ok(parse_identify(&data))
}

fn field(data: &[u8], range: std::ops::Range<usize>) -> Option<&str> {
    let raw = data.get(range)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(raw.get(..end)?).ok().map(str::trim)
}

/// Extract the requested device name from an Identify Controller page.
pub fn parse_identify(data: &[u8]) -> Option<String> {
    if field(data, MODEL)? != EBS_MODEL {
        return None;
    }
    let name = field(data, VENDOR_DEVICE_NAME)?.trim_start_matches("/dev/");
    (!name.is_empty()).then(|| name.to_string())
}
