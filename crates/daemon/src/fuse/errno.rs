//! Engine errors as errno values for the kernel

use libc::c_int;

use common::prelude::FsError;
use common::xattr::AttributeError;

/// Missing extended attribute
#[cfg(target_os = "macos")]
pub const NO_ATTRIBUTE: c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
pub const NO_ATTRIBUTE: c_int = libc::ENODATA;

pub fn errno(err: &FsError) -> c_int {
    match err {
        FsError::NameTooLong(_) => libc::ENAMETOOLONG,
        FsError::InvalidPath(_) => libc::EINVAL,
        FsError::NotFound(_) => libc::ENOENT,
        FsError::NotPermitted(_) => libc::EACCES,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::IsDirectory(_) => libc::EISDIR,
        FsError::NotDirectory(_) => libc::ENOTDIR,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::Attribute(AttributeError::NotFound(_)) => NO_ATTRIBUTE,
        FsError::Attribute(AttributeError::Reserved(_)) => libc::EPERM,
        FsError::Model(_) | FsError::Codec(_) | FsError::Remote(_) => libc::EIO,
    }
}
