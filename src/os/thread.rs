/// Kernel id of the calling thread
pub fn current_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions and can't fail
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Kernel ids of every thread in this process, read from `/proc/self/task`.
/// Empty if procfs isn't available.
pub fn thread_ids() -> Vec<u64> {
    let Ok(dir) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    let mut ids: Vec<u64> = dir
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_thread_is_listed() {
        let ids = thread_ids();
        assert!(ids.contains(&current_thread_id()));
    }
}
