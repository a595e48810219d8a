//! Extended-attribute helpers.
//!
//! Storage units stamp the volume-id xattr on their brick root and the PV
//! engine writes simple-quota limits; both go through these wrappers.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn cstr_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn cstr_name(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))
}

/// How an existing attribute is treated by [`set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Create or replace.
    Any,
    /// Fail with `EEXIST` when the attribute is already present.
    CreateOnly,
}

/// Set `name` on `path` to `value`.
pub fn set(path: &Path, name: &str, value: &[u8], mode: SetMode) -> io::Result<()> {
    let path_c = cstr_path(path)?;
    let name_c = cstr_name(name)?;
    let flags = match mode {
        SetMode::Any => 0,
        SetMode::CreateOnly => libc::XATTR_CREATE,
    };
    // SAFETY: both strings are NUL-terminated and `value` outlives the call.
    let ret = unsafe {
        libc::setxattr(
            path_c.as_ptr(),
            name_c.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read `name` from `path`; `Ok(None)` when the attribute is absent.
pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let path_c = cstr_path(path)?;
    let name_c = cstr_name(name)?;

    // SAFETY: a null buffer with size 0 only queries the value length.
    let len = unsafe {
        libc::getxattr(path_c.as_ptr(), name_c.as_ptr(), std::ptr::null_mut(), 0)
    };
    if len < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(None);
        }
        return Err(err);
    }

    let mut buf = vec![0u8; len as usize];
    // SAFETY: `buf` has exactly `len` writable bytes.
    let ret = unsafe {
        libc::getxattr(
            path_c.as_ptr(),
            name_c.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(ret as usize);
    Ok(Some(buf))
}

/// Remove `name` from `path`, ignoring a missing attribute.
pub fn remove(path: &Path, name: &str) -> io::Result<()> {
    let path_c = cstr_path(path)?;
    let name_c = cstr_name(name)?;
    // SAFETY: both strings are NUL-terminated.
    let ret = unsafe { libc::removexattr(path_c.as_ptr(), name_c.as_ptr()) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// `true` when the filesystem rejects xattrs altogether.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP) | Some(libc::EPERM) | Some(libc::EACCES)
    )
}
