//! Postmortem thread dumps for a monitored process.
//!
//! Captured at violation or interrupt time and attached to the emitted event.
//! Only thread identity and scheduler state are available from outside the
//! process; that is usually enough to tell a deadlocked pool from a busy one.

#[cfg(target_os = "linux")]
pub fn capture_thread_dump(pid: u32) -> Option<String> {
    use std::fmt::Write;

    let process = procfs::process::Process::new(pid as i32).ok()?;
    let tasks = process.tasks().ok()?;
    let mut dump = String::new();
    for task in tasks.flatten() {
        let Ok(stat) = task.stat() else {
            continue;
        };
        let _ = writeln!(
            dump,
            "# thread {} ({}) state={} utime={} stime={}",
            task.tid, stat.comm, stat.state, stat.utime, stat.stime
        );
    }
    (!dump.is_empty()).then_some(dump)
}

#[cfg(not(target_os = "linux"))]
pub fn capture_thread_dump(_pid: u32) -> Option<String> {
    None
}
