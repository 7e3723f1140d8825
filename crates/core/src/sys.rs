//! Host queries: free space on a volume and physical memory.

use std::path::Path;

/// Fallback process memory budget when the host cannot be queried (256MB).
const FALLBACK_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Bytes available to unprivileged users on the volume holding `path`.
///
/// # Errors
///
/// Returns `std::io::Error` if the syscall fails or the platform is unsupported.
#[cfg(target_family = "unix")]
pub fn available_space(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a plain C struct of integers; all-zero is a valid value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path_cstr is a valid NUL-terminated string and stat is a valid
    // mutable reference for the duration of the call.
    let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };

    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_family = "unix"))]
pub fn available_space(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free space checking currently only supported on Unix systems",
    ))
}

/// Physical memory of the host in bytes, used as the process memory budget.
#[cfg(target_family = "unix")]
pub fn physical_memory() -> u64 {
    // SAFETY: sysconf has no preconditions; it returns -1 for unknown names.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    // SAFETY: as above.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if pages <= 0 || page_size <= 0 {
        tracing::warn!("Could not query physical memory, assuming {} bytes", FALLBACK_MEMORY_BYTES);
        return FALLBACK_MEMORY_BYTES;
    }

    (pages as u64).saturating_mul(page_size as u64)
}

#[cfg(not(target_family = "unix"))]
pub fn physical_memory() -> u64 {
    FALLBACK_MEMORY_BYTES
}
