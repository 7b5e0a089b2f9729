//! PCI address resolution and BAR0 mapping.
//!
//! This crate is the external collaborator the driver core hands a mapped
//! BAR0 base pointer to: PCI enumeration, class-ID validation, and the
//! choice between a plain `resource0` mmap and a VFIO-mediated mapping are
//! all out of the core's scope (see the top-level spec), but the crate
//! needs one concrete implementation to run against real hardware.
//!
//! # Path selection
//!
//! `/sys/bus/pci/devices/<addr>/iommu_group` existing means the device sits
//! in an IOMMU group; VFIO is then used so the mapping is safe under an
//! IOMMU-enforced address space. Otherwise BAR0 is mapped directly from the
//! `resource0` sysfs file, which is sufficient on systems without IOMMU
//! isolation.

use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

// ═══════════════════════════════════════════════════════════════════════════
// PCI ADDRESS
// ═══════════════════════════════════════════════════════════════════════════

/// A PCI device address in `DDDD:BB:DD.F` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciAddr {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    text: String,
}

impl PciAddr {
    /// Parse a PCI address string such as `"0000:17:00.0"`.
    pub fn parse(addr: &str) -> Result<Self, PciError> {
        let (domain_bus_dev, function) =
            addr.split_once('.').ok_or(PciError::InvalidAddress)?;
        let mut parts = domain_bus_dev.split(':');
        let domain = parts.next().ok_or(PciError::InvalidAddress)?;
        let bus = parts.next().ok_or(PciError::InvalidAddress)?;
        let device = parts.next().ok_or(PciError::InvalidAddress)?;
        if parts.next().is_some() {
            return Err(PciError::InvalidAddress);
        }
        Ok(Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| PciError::InvalidAddress)?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| PciError::InvalidAddress)?,
            device: u8::from_str_radix(device, 16).map_err(|_| PciError::InvalidAddress)?,
            function: u8::from_str_radix(function, 16).map_err(|_| PciError::InvalidAddress)?,
            text: addr.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// PCI resolution and BAR0 mapping errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PciError {
    /// Malformed `DDDD:BB:DD.F` address string.
    InvalidAddress,
    /// Could not read a sysfs attribute file for the device.
    SysfsReadFailed(String),
    /// The device's PCI base class is not 0x02 (network controller).
    NotANic { class: u8 },
    /// `mmap` of BAR0 failed.
    MmapFailed,
    /// A VFIO ioctl failed.
    VfioIoctl(&'static str),
}

impl PciError {
    pub fn description(&self) -> String {
        match self {
            PciError::InvalidAddress => "malformed PCI address".to_string(),
            PciError::SysfsReadFailed(path) => format!("failed to read sysfs attribute: {}", path),
            PciError::NotANic { class } => format!("device is not a NIC (class 0x{:02x})", class),
            PciError::MmapFailed => "mmap of BAR0 failed".to_string(),
            PciError::VfioIoctl(name) => format!("VFIO ioctl failed: {}", name),
        }
    }
}

impl std::fmt::Display for PciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

impl std::error::Error for PciError {}

// ═══════════════════════════════════════════════════════════════════════════
// SYSFS RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════

/// Root of the sysfs PCI device tree. Overridable so tests can point it at
/// a temporary directory standing in for `/sys/bus/pci/devices`.
pub fn sysfs_root() -> PathBuf {
    PathBuf::from("/sys/bus/pci/devices")
}

fn device_dir(root: &Path, addr: &PciAddr) -> PathBuf {
    root.join(addr.as_str())
}

/// Read the device's PCI base class from `<device>/class`. The sysfs class
/// attribute is `0x00CCSSPP`; the base class occupies the top byte of the
/// low 24 bits (bits 23:16), matching `config[8..12] >> 24` read directly
/// from PCI config space offset 8 on real hardware.
fn read_base_class(root: &Path, addr: &PciAddr) -> Result<u8, PciError> {
    let path = device_dir(root, addr).join("class");
    let contents = fs::read_to_string(&path)
        .map_err(|_| PciError::SysfsReadFailed(path.display().to_string()))?;
    let trimmed = contents.trim().trim_start_matches("0x");
    let class_word = u32::from_str_radix(trimmed, 16).map_err(|_| PciError::SysfsReadFailed(path.display().to_string()))?;
    Ok(((class_word >> 16) & 0xff) as u8)
}

/// Whether the device sits in an IOMMU group (VFIO is usable).
fn has_iommu_group(root: &Path, addr: &PciAddr) -> bool {
    device_dir(root, addr).join("iommu_group").exists()
}

// ═══════════════════════════════════════════════════════════════════════════
// BAR0 MAPPING
// ═══════════════════════════════════════════════════════════════════════════

/// A mapped BAR0 region. Dropping it does not unmap — matching the source,
/// whose device lifetime is the process lifetime (see concurrency model).
pub struct Bar0 {
    pub addr: *mut u8,
    pub len: usize,
    // Kept alive for the VFIO path; the container/group/device fds must
    // outlive the mapping.
    _vfio: Option<VfioHandles>,
}

// SAFETY: BAR0 is a single physically shared MMIO region; the driver core
// wraps `addr` in its own `Bar` type that disciplines all access through
// volatile reads/writes.
unsafe impl Send for Bar0 {}

struct VfioHandles {
    _container: File,
    _group: File,
    _device: File,
}

/// Resolve `pci_addr`, validate it is a NIC (base class 0x02), and map
/// BAR0 — via VFIO if an IOMMU group is present, otherwise via the plain
/// `resource0` sysfs file.
pub fn open_bar0(pci_addr: &str) -> Result<Bar0, PciError> {
    let addr = PciAddr::parse(pci_addr)?;
    let root = sysfs_root();

    let class = read_base_class(&root, &addr)?;
    if class != 0x02 {
        return Err(PciError::NotANic { class });
    }

    if has_iommu_group(&root, &addr) {
        log::info!("{}: iommu_group present, mapping BAR0 via VFIO", pci_addr);
        map_bar0_vfio(&root, &addr)
    } else {
        log::info!("{}: no iommu_group, mapping BAR0 via resource0", pci_addr);
        map_bar0_plain(&root, &addr)
    }
}

fn map_bar0_plain(root: &Path, addr: &PciAddr) -> Result<Bar0, PciError> {
    let resource_path = device_dir(root, addr).join("resource0");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&resource_path)
        .map_err(|_| PciError::SysfsReadFailed(resource_path.display().to_string()))?;
    let len = file
        .metadata()
        .map_err(|_| PciError::SysfsReadFailed(resource_path.display().to_string()))?
        .len() as usize;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PciError::MmapFailed);
    }

    Ok(Bar0 { addr: ptr as *mut u8, len, _vfio: None })
}

// ═══════════════════════════════════════════════════════════════════════════
// VFIO (IOMMU group mapping)
// ═══════════════════════════════════════════════════════════════════════════

const VFIO_GET_API_VERSION: libc::c_ulong = 15204;
const VFIO_CHECK_EXTENSION: libc::c_ulong = 15205;
const VFIO_SET_IOMMU: libc::c_ulong = 15206;
const VFIO_GROUP_GET_STATUS: libc::c_ulong = 15207;
const VFIO_GROUP_SET_CONTAINER: libc::c_ulong = 15208;
const VFIO_GROUP_GET_DEVICE_FD: libc::c_ulong = 15210;
const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = 15212;

const VFIO_API_VERSION: i32 = 0;
const VFIO_TYPE1_IOMMU: libc::c_ulong = 1;
const VFIO_GROUP_FLAGS_VIABLE: u32 = 1;
const VFIO_PCI_BAR0_REGION_INDEX: u32 = 0;

/// `struct vfio_group_status` from `linux/vfio.h`.
#[repr(C)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// `struct vfio_region_info` from `linux/vfio.h`.
#[repr(C)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
const PCI_COMMAND_OFFSET: u64 = 4;
const PCI_COMMAND_BUS_MASTER_BIT: u16 = 1 << 2;

/// Set the bus-master-enable bit in the PCI command register (PCIe 3.0
/// §7.5.1.1) through the VFIO config-space region. Required before the NIC
/// can issue any DMA — without it every descriptor/completion ring write
/// the device attempts silently fails.
fn enable_bus_mastering(device_file: &mut File, device_fd: RawFd) -> Result<(), PciError> {
    let config_region = VfioRegionInfo {
        argsz: mem::size_of::<VfioRegionInfo>() as u32,
        flags: 0,
        index: VFIO_PCI_CONFIG_REGION_INDEX,
        cap_offset: 0,
        size: 0,
        offset: 0,
    };
    unsafe {
        if libc::ioctl(device_fd, VFIO_DEVICE_GET_REGION_INFO, &config_region) == -1 {
            return Err(PciError::VfioIoctl("VFIO_DEVICE_GET_REGION_INFO(config)"));
        }
    }

    let command_offset = config_region.offset + PCI_COMMAND_OFFSET;
    device_file
        .seek(SeekFrom::Start(command_offset))
        .map_err(|_| PciError::VfioIoctl("seek to command register"))?;
    let mut buf = [0u8; 2];
    device_file.read_exact(&mut buf).map_err(|_| PciError::VfioIoctl("read command register"))?;
    let mut command = u16::from_ne_bytes(buf);
    command |= PCI_COMMAND_BUS_MASTER_BIT;

    device_file
        .seek(SeekFrom::Start(command_offset))
        .map_err(|_| PciError::VfioIoctl("seek to command register"))?;
    device_file
        .write_all(&command.to_ne_bytes())
        .map_err(|_| PciError::VfioIoctl("write command register"))?;
    Ok(())
}

fn map_bar0_vfio(root: &Path, addr: &PciAddr) -> Result<Bar0, PciError> {
    let group_link = device_dir(root, addr).join("iommu_group");
    let group_target =
        fs::read_link(&group_link).map_err(|_| PciError::SysfsReadFailed(group_link.display().to_string()))?;
    let group_id = group_target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(PciError::SysfsReadFailed(group_link.display().to_string()))?;

    let container = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/vfio/vfio")
        .map_err(|_| PciError::SysfsReadFailed("/dev/vfio/vfio".to_string()))?;
    let cfd = container.as_raw_fd();

    unsafe {
        if libc::ioctl(cfd, VFIO_GET_API_VERSION) != VFIO_API_VERSION {
            log::warn!("unexpected VFIO API version for {}", addr.as_str());
        }
        if libc::ioctl(cfd, VFIO_CHECK_EXTENSION, VFIO_TYPE1_IOMMU) != 1 {
            return Err(PciError::VfioIoctl("VFIO_CHECK_EXTENSION(TYPE1_IOMMU)"));
        }
    }

    let group = OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/dev/vfio/{}", group_id))
        .map_err(|_| PciError::SysfsReadFailed(format!("/dev/vfio/{}", group_id)))?;
    let gfd = group.as_raw_fd();

    let group_status = VfioGroupStatus { argsz: mem::size_of::<VfioGroupStatus>() as u32, flags: 0 };
    unsafe {
        if libc::ioctl(gfd, VFIO_GROUP_GET_STATUS, &group_status) == -1 {
            return Err(PciError::VfioIoctl("VFIO_GROUP_GET_STATUS"));
        }
        if group_status.flags & VFIO_GROUP_FLAGS_VIABLE != VFIO_GROUP_FLAGS_VIABLE {
            return Err(PciError::VfioIoctl("group not viable"));
        }
        if libc::ioctl(gfd, VFIO_GROUP_SET_CONTAINER, &cfd) == -1 {
            return Err(PciError::VfioIoctl("VFIO_GROUP_SET_CONTAINER"));
        }
        if libc::ioctl(cfd, VFIO_SET_IOMMU, VFIO_TYPE1_IOMMU) == -1 {
            return Err(PciError::VfioIoctl("VFIO_SET_IOMMU"));
        }
    }

    let device_fd = unsafe { libc::ioctl(gfd, VFIO_GROUP_GET_DEVICE_FD, addr.as_str().as_ptr()) };
    if device_fd == -1 {
        return Err(PciError::VfioIoctl("VFIO_GROUP_GET_DEVICE_FD"));
    }
    let mut device_file = unsafe { File::from_raw_fd(device_fd) };

    enable_bus_mastering(&mut device_file, device_fd)?;

    let bar0_region = VfioRegionInfo {
        argsz: mem::size_of::<VfioRegionInfo>() as u32,
        flags: 0,
        index: VFIO_PCI_BAR0_REGION_INDEX,
        cap_offset: 0,
        size: 0,
        offset: 0,
    };
    unsafe {
        if libc::ioctl(device_fd, VFIO_DEVICE_GET_REGION_INFO, &bar0_region) == -1 {
            return Err(PciError::VfioIoctl("VFIO_DEVICE_GET_REGION_INFO(BAR0)"));
        }
    }

    let len = bar0_region.size as usize;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            device_fd,
            bar0_region.offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PciError::MmapFailed);
    }

    Ok(Bar0 {
        addr: ptr as *mut u8,
        len,
        _vfio: Some(VfioHandles { _container: container, _group: group, _device: device_file }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn parses_pci_address() {
        let addr = PciAddr::parse("0000:17:00.0").unwrap();
        assert_eq!(addr.domain, 0x0000);
        assert_eq!(addr.bus, 0x17);
        assert_eq!(addr.device, 0x00);
        assert_eq!(addr.function, 0);
    }

    #[test]
    fn rejects_malformed_address() {
        assert_eq!(PciAddr::parse("not-an-address"), Err(PciError::InvalidAddress));
    }

    #[test]
    fn reads_base_class_from_fake_sysfs() {
        let dir = std::env::temp_dir().join(format!("mqnic-pci-test-{}", std::process::id()));
        let addr = PciAddr::parse("0000:17:00.0").unwrap();
        write_file(&device_dir(&dir, &addr).join("class"), "0x020000\n");
        assert_eq!(read_base_class(&dir, &addr).unwrap(), 0x02);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_non_nic_class() {
        let dir = std::env::temp_dir().join(format!("mqnic-pci-test-nonnic-{}", std::process::id()));
        let addr = PciAddr::parse("0000:17:00.0").unwrap();
        write_file(&device_dir(&dir, &addr).join("class"), "0x030000\n");
        assert_eq!(read_base_class(&dir, &addr).unwrap(), 0x03);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn iommu_group_absent_selects_plain_path() {
        let dir = std::env::temp_dir().join(format!("mqnic-pci-test-noiommu-{}", std::process::id()));
        let addr = PciAddr::parse("0000:17:00.0").unwrap();
        fs::create_dir_all(device_dir(&dir, &addr)).unwrap();
        assert!(!has_iommu_group(&dir, &addr));
    }
}
