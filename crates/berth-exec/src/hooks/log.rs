//! Stderr logging usable between `fork()` and `execve()`.
//!
//! Nothing here allocates or takes a lock.

/// Writes every part to stderr, in order.
#[cfg(unix)]
pub(crate) fn raw_log(parts: &[&[u8]]) {
    for part in parts {
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr() as *const libc::c_void, part.len());
        }
    }
}

/// Logs `berth-exec: <what>: errno=<n>`.
#[cfg(unix)]
pub(crate) fn raw_log_errno(what: &[u8], errno: i32) {
    let mut buf = [0u8; 12];
    let digits = format_errno(errno, &mut buf);
    raw_log(&[b"berth-exec: ", what, b": errno=", digits, b"\n"]);
}

/// Renders `errno` in decimal into the tail of `buf`.
pub(crate) fn format_errno(errno: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut idx = buf.len();
    let mut n = errno.unsigned_abs();
    loop {
        idx -= 1;
        buf[idx] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if errno < 0 {
        idx -= 1;
        buf[idx] = b'-';
    }
    &buf[idx..]
}
