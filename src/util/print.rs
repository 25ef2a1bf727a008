use std::fmt;

/// Write raw bytes to stderr. This goes straight to `write(2)`, so it doesn't
/// use the allocator and doesn't take the `std::io::stderr()` lock, which
/// makes it fine to call with allocator locks held or from a signal handler.
pub fn debug_output_bytes(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, fd 2 is always a valid argument
        // (the call fails with EBADF at worst).
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            if written < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
            {
                continue;
            }
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// `OutputDebugString()`, more or less
pub fn debug_output(message: &str) {
    debug_output_bytes(message.as_bytes());
}

/// Stop here if a debugger is attached, die with SIGTRAP if one isn't.
pub fn debug_break() {
    // SAFETY: raise() has no preconditions
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
}

/// A `fmt::Write` sink over a fixed array. Anything past the end is dropped
/// and `truncated` is set.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Truncation happens on char boundaries (see `write_str`) so this is
        // always valid UTF-8, but be robust anyway.
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // SAFETY: `valid_up_to()` is a char boundary
                unsafe { std::str::from_utf8_unchecked(&self.buf[..e.valid_up_to()]) }
            }
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

/// `println!()` to the debug output sink, without allocating. Lines longer
/// than the internal buffer are truncated.
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {{
        use ::std::fmt::Write as _;
        let mut __w = $crate::util::print::StackWriter::<512>::new();
        _ = ::std::write!(__w, $($arg)*);
        _ = __w.write_str("\n");
        $crate::util::print::debug_output_bytes(__w.as_bytes());
    }};
}
