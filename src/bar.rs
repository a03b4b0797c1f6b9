// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory-mapped PCI BARs.
//!
//! A [`BarMapping`] maps a sysfs `resourceN` file and exposes it through
//! [`RegisterAccess`]. Accesses of 1, 2, 4 or 8 bytes at naturally aligned
//! offsets are issued as a single volatile load or store of that width, as
//! MMIO registers require; anything else is split into byte accesses.
//!
//! # Platform Support
//!
//! Only Linux is supported. On other platforms [`BarMapping::open`] returns
//! [`P2pError::PlatformNotSupported`].

use crate::access::RegisterAccess;
use crate::error::{P2pError, P2pResult};
use std::path::Path;

#[cfg(target_os = "linux")]
use crate::access::check_range;
#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;

    /// A mapped BAR.
    pub struct BarMapping {
        /// Keeps the resource file open for the lifetime of the mapping.
        #[allow(dead_code)]
        file: File,
        ptr: *mut u8,
        size: usize,
    }

    impl BarMapping {
        /// Map the whole resource file at `path` read/write.
        ///
        /// # Errors
        ///
        /// Returns an error if:
        /// - The file cannot be opened (permissions, not found)
        /// - The file is empty
        /// - Memory mapping fails
        pub fn open(path: &Path) -> P2pResult<Self> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        P2pError::PermissionDenied(path.display().to_string())
                    } else {
                        P2pError::Io(e)
                    }
                })?;

            let size = file.metadata()?.len() as usize;
            if size == 0 {
                return Err(P2pError::MmapFailed(format!(
                    "{} has zero length",
                    path.display()
                )));
            }

            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(P2pError::MmapFailed(format!(
                    "mmap failed for {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }

            log::debug!("mapped {} ({:#x} bytes)", path.display(), size);

            Ok(Self {
                file,
                ptr: ptr as *mut u8,
                size,
            })
        }
    }

    impl RegisterAccess for BarMapping {
        fn size(&self) -> u64 {
            self.size as u64
        }

        fn read_into(&self, offset: u64, buf: &mut [u8]) -> P2pResult<()> {
            check_range(self.size as u64, offset, buf.len())?;
            // SAFETY: range checked against the mapping above.
            unsafe {
                let p = self.ptr.add(offset as usize);
                match buf.len() {
                    8 if offset % 8 == 0 => {
                        let v = std::ptr::read_volatile(p as *const u64);
                        buf.copy_from_slice(&v.to_ne_bytes());
                    }
                    4 if offset % 4 == 0 => {
                        let v = std::ptr::read_volatile(p as *const u32);
                        buf.copy_from_slice(&v.to_ne_bytes());
                    }
                    2 if offset % 2 == 0 => {
                        let v = std::ptr::read_volatile(p as *const u16);
                        buf.copy_from_slice(&v.to_ne_bytes());
                    }
                    _ => {
                        for (i, b) in buf.iter_mut().enumerate() {
                            *b = std::ptr::read_volatile(p.add(i));
                        }
                    }
                }
            }
            Ok(())
        }

        fn write_from(&self, offset: u64, data: &[u8]) -> P2pResult<()> {
            check_range(self.size as u64, offset, data.len())?;
            // SAFETY: range checked against the mapping above.
            unsafe {
                let p = self.ptr.add(offset as usize);
                match *data {
                    [a, b, c, d, e, f, g, h] if offset % 8 == 0 => {
                        let v = u64::from_ne_bytes([a, b, c, d, e, f, g, h]);
                        std::ptr::write_volatile(p as *mut u64, v);
                    }
                    [a, b, c, d] if offset % 4 == 0 => {
                        std::ptr::write_volatile(p as *mut u32, u32::from_ne_bytes([a, b, c, d]));
                    }
                    [a, b] if offset % 2 == 0 => {
                        std::ptr::write_volatile(p as *mut u16, u16::from_ne_bytes([a, b]));
                    }
                    _ => {
                        for (i, b) in data.iter().enumerate() {
                            std::ptr::write_volatile(p.add(i), *b);
                        }
                    }
                }
            }
            Ok(())
        }
    }

    impl std::fmt::Debug for BarMapping {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BarMapping")
                .field("size", &format_args!("{:#x}", self.size))
                .finish()
        }
    }

    impl Drop for BarMapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

// ============================================================================
// Non-Linux Stub Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    /// Stub BAR mapping for unsupported platforms.
    #[derive(Debug)]
    pub struct BarMapping {
        _private: (),
    }

    impl BarMapping {
        /// Always fails with [`P2pError::PlatformNotSupported`].
        pub fn open(_path: &Path) -> P2pResult<Self> {
            Err(P2pError::PlatformNotSupported)
        }
    }

    impl RegisterAccess for BarMapping {
        fn size(&self) -> u64 {
            0
        }

        fn read_into(&self, _offset: u64, _buf: &mut [u8]) -> P2pResult<()> {
            Err(P2pError::PlatformNotSupported)
        }

        fn write_from(&self, _offset: u64, _data: &[u8]) -> P2pResult<()> {
            Err(P2pError::PlatformNotSupported)
        }
    }
}

// ============================================================================
// Public Re-exports
// ============================================================================

#[cfg(target_os = "linux")]
pub use linux_impl::BarMapping;

#[cfg(not(target_os = "linux"))]
pub use stub_impl::BarMapping;
