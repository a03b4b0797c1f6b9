// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! PCI BAR base address resolution.
//!
//! The kernel exposes one line per PCI region in
//! `/sys/bus/pci/devices/<DDDD:BB:DD.F>/resource`; the first field of each
//! line is the region's start address in hex and the line number is the BAR
//! index. Those bus addresses are what a peer device must be programmed
//! with to reach this device's registers and buffers.

use crate::error::{P2pError, P2pResult};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// sysfs directory holding one entry per PCI function.
pub const SYSFS_PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// A PCI function address in `DDDD:BB:DD.F` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || P2pError::InvalidDeviceId(s.to_string());

        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let hex = |field: &str, digits: usize| -> Option<u32> {
            if field.len() != digits || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            u32::from_str_radix(field, 16).ok()
        };

        let function = match function.as_bytes() {
            [f @ b'0'..=b'7'] => f - b'0',
            _ => return Err(invalid()),
        };

        Ok(Self {
            domain: hex(domain, 4).ok_or_else(invalid)? as u16,
            bus: hex(bus, 2).ok_or_else(invalid)? as u8,
            device: hex(device, 2).ok_or_else(invalid)? as u8,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// BAR base addresses of one device, in BAR index order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BarTable {
    bases: Vec<u64>,
}

impl BarTable {
    pub fn from_bases(bases: Vec<u64>) -> Self {
        Self { bases }
    }

    /// Base of BAR `index`, or `None` if the table has no such entry or the
    /// region is unassigned (zero).
    pub fn get(&self, index: usize) -> Option<u64> {
        self.bases.get(index).copied().filter(|&base| base != 0)
    }

    /// Number of table entries, assigned or not.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Assigned BARs as `(index, base)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.bases
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, base)| base != 0)
    }

    /// Raw entries, zeros included.
    pub fn as_slice(&self) -> &[u64] {
        &self.bases
    }
}

impl fmt::Debug for BarTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bases.iter().map(|b| format!("{:#x}", b)))
            .finish()
    }
}

/// Reads BAR tables from a sysfs PCI device directory.
#[derive(Debug, Clone)]
pub struct BarResolver {
    root: PathBuf,
}

impl Default for BarResolver {
    fn default() -> Self {
        Self::new(SYSFS_PCI_DEVICES_PATH)
    }
}

impl BarResolver {
    /// Resolver rooted at `root` instead of [`SYSFS_PCI_DEVICES_PATH`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `resource<index>` file that maps BAR `index` of `addr`.
    pub fn resource_path(&self, addr: &PciAddress, index: usize) -> PathBuf {
        self.root
            .join(addr.to_string())
            .join(format!("resource{}", index))
    }

    /// Read the BAR table of device `bdf`.
    ///
    /// # Errors
    ///
    /// - [`P2pError::InvalidDeviceId`] if `bdf` is not `DDDD:BB:DD.F`
    /// - [`P2pError::DeviceNotFound`] if the device has no resource table
    /// - [`P2pError::MalformedResource`] if a line does not start with a hex
    ///   address
    pub fn resolve(&self, bdf: &str) -> P2pResult<BarTable> {
        let addr: PciAddress = bdf.parse()?;
        // Use the caller's spelling; sysfs names are lowercase but the
        // pattern accepts either case.
        let path = self.root.join(bdf).join("resource");

        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => P2pError::DeviceNotFound(bdf.to_string()),
            ErrorKind::PermissionDenied => {
                P2pError::PermissionDenied(format!("{}: {}", path.display(), e))
            }
            _ => P2pError::Io(e),
        })?;

        let bases = parse_resource_table(&text, bdf)?;
        let table = BarTable::from_bases(bases);
        log::debug!("BARs of {}: {:?}", addr, table);
        Ok(table)
    }
}

/// Resolve the BAR table of `bdf` under [`SYSFS_PCI_DEVICES_PATH`].
pub fn resolve_bars(bdf: &str) -> P2pResult<BarTable> {
    BarResolver::default().resolve(bdf)
}

fn parse_resource_table(text: &str, device: &str) -> P2pResult<Vec<u64>> {
    let mut bases = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = || P2pError::MalformedResource {
            device: device.to_string(),
            line: index + 1,
        };
        let first = line.split_whitespace().next().ok_or_else(malformed)?;
        let digits = first
            .strip_prefix("0x")
            .or_else(|| first.strip_prefix("0X"))
            .unwrap_or(first);
        let base = u64::from_str_radix(digits, 16).map_err(|_| malformed())?;
        bases.push(base);
    }
    Ok(bases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sysfs_with(bdf: &str, table: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join(bdf);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("resource"), table).unwrap();
        dir
    }

    #[test]
    fn test_parse_pci_address() {
        let addr: PciAddress = "0000:03:00.1".parse().unwrap();
        assert_eq!(
            addr,
            PciAddress {
                domain: 0,
                bus: 3,
                device: 0,
                function: 1
            }
        );
        assert_eq!(addr.to_string(), "0000:03:00.1");
        let upper: PciAddress = "ABCD:EF:1F.7".parse().unwrap();
        assert_eq!(upper.to_string(), "abcd:ef:1f.7");
    }

    #[test]
    fn test_reject_invalid_pci_address() {
        for bad in [
            "",
            "0000:03:00",
            "0000:03:00.8",
            "000:03:00.0",
            "0000:3:00.0",
            "0000:03:000.0",
            "0000:03:00.0 ",
            "g000:03:00.0",
            "0000-03-00.0",
            "0000:03:00.01",
        ] {
            assert!(
                matches!(bad.parse::<PciAddress>(), Err(P2pError::InvalidDeviceId(ref s)) if s == bad),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_resolve_three_regions() {
        let dir = sysfs_with(
            "0000:03:00.0",
            "0x0000000000001000 0x0000000000001fff 0x0000000000040200\n\
             0x0000000000002000 0x0000000000002fff 0x0000000000040200\n\
             0x0000000000003000 0x0000000000003fff 0x0000000000040200\n",
        );
        let table = BarResolver::new(dir.path()).resolve("0000:03:00.0").unwrap();
        assert_eq!(table.as_slice(), &[0x1000, 0x2000, 0x3000]);
        assert_eq!(table.get(0), Some(0x1000));
        assert_eq!(table.get(2), Some(0x3000));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn test_zero_entries_are_unassigned() {
        let dir = sysfs_with(
            "0000:03:00.0",
            "0xf0000000 0xf0ffffff 0x40200\n0x0 0x0 0x0\n0xe0000000 0xe0ffffff 0x40200\n",
        );
        let table = BarResolver::new(dir.path()).resolve("0000:03:00.0").unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1), None);
        assert_eq!(
            table.iter().collect::<Vec<_>>(),
            vec![(0, 0xf000_0000), (2, 0xe000_0000)]
        );
    }

    #[test]
    fn test_device_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = BarResolver::new(dir.path()).resolve("0000:04:00.0");
        assert!(matches!(err, Err(P2pError::DeviceNotFound(ref s)) if s == "0000:04:00.0"));
    }

    #[test]
    fn test_invalid_id_checked_before_filesystem() {
        let resolver = BarResolver::new("/nonexistent");
        assert!(matches!(
            resolver.resolve("../../etc"),
            Err(P2pError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_malformed_line() {
        let dir = sysfs_with("0000:03:00.0", "0x1000 0x1fff 0x0\nnot-hex 0x0 0x0\n");
        let err = BarResolver::new(dir.path()).resolve("0000:03:00.0");
        assert!(matches!(
            err,
            Err(P2pError::MalformedResource { line: 2, .. })
        ));
    }

    #[test]
    fn test_resource_path() {
        let resolver = BarResolver::new("/sys/bus/pci/devices");
        let addr: PciAddress = "0000:03:00.0".parse().unwrap();
        assert_eq!(
            resolver.resource_path(&addr, 2),
            PathBuf::from("/sys/bus/pci/devices/0000:03:00.0/resource2")
        );
        assert_eq!(BarResolver::default().root(), Path::new(SYSFS_PCI_DEVICES_PATH));
    }
}
