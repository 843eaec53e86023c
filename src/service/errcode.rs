//! Stable wire error codes.
//!
//! Request statuses end up in the transaction log's commit error checksum,
//! so they must not vary with the host platform. Codes below 1000 mirror
//! the classic POSIX assignments; subsystem codes start at 1000.

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const ENOTDIR: i32 = 20;
pub const EISDIR: i32 = 21;
pub const EINVAL: i32 = 22;
pub const EFBIG: i32 = 27;
pub const ENOSPC: i32 = 28;
pub const EROFS: i32 = 30;

/// A request that required logging could not be appended to the journal.
pub const ELOGFAILED: i32 = 1005;

/// Translates a host errno into its wire-stable counterpart. Codes without
/// a stable assignment collapse to `EINVAL`.
pub fn sys_to_wire_errno(errno: i32) -> i32 {
    match errno {
        EPERM | ENOENT | EIO | EBADF | ENOMEM | EACCES | EFAULT | EBUSY | EEXIST | ENOTDIR
        | EISDIR | EINVAL | EFBIG | ENOSPC | EROFS | ELOGFAILED => errno,
        _ => EINVAL,
    }
}

/// Wire code for an I/O failure; anything without a stable assignment is
/// reported as `EIO`.
pub fn wire_errno_of(err: &std::io::Error) -> i32 {
    let raw = match err.raw_os_error() {
        Some(raw) => raw,
        None => return EIO,
    };
    let mapped = sys_to_wire_errno(raw);
    if mapped == EINVAL && raw != EINVAL {
        EIO
    } else {
        mapped
    }
}
