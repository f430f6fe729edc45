/// Best-effort check that `pid` still maps to a live process on this host.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only performs the permission and existence checks.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// No process-handle API is linked on this target, so any recorded pid counts as
// live and the session is left alone until its final metadata appears.
#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid > 0
}
