//! Platform shims and crash reporting helpers.

use std::backtrace::Backtrace;
use std::cell::Cell;

/// Returns the OS-level id of the calling thread (what `gettid(2)` reports,
/// not the pthread handle). The id is cached in a thread-local on first use.
pub fn thread_id() -> i32 {
    thread_local! {
        static TID: Cell<i32> = Cell::new(-1);
    }

    let cached = TID.try_with(|tid| {
        let mut id = tid.get();
        if id == -1 {
            id = os_thread_id();
            tid.set(id);
        }
        id
    });
    // thread-local storage may already be gone during thread teardown
    cached.unwrap_or_else(|_| os_thread_id())
}

#[inline]
fn os_thread_id() -> i32 {
    // Safety: gettid has no preconditions and cannot fail
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Renders a best-effort backtrace of the calling thread.
///
/// At most `frames` frames are included, the first `skip` frames (the
/// capture machinery itself) are dropped, and every emitted line is
/// prefixed with `prefix`.
pub fn backtrace_to_string(frames: usize, skip: usize, prefix: &str) -> String {
    let captured = Backtrace::force_capture().to_string();
    let mut out = String::new();
    let mut frame_no = 0usize;
    let mut emitting = false;
    for line in captured.lines() {
        if is_frame_header(line) {
            frame_no += 1;
            if frame_no > skip + frames {
                break;
            }
            emitting = frame_no > skip;
        }
        if emitting {
            out.push_str(prefix);
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out
}

// The std backtrace renderer emits "<n>: <symbol>" header lines, each
// optionally followed by an indented "at <file>:<line>" continuation.
fn is_frame_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    match trimmed.find(':') {
        Some(pos) if pos > 0 => trimmed[..pos].bytes().all(|b| b.is_ascii_digit()),
        _ => false,
    }
}

/// Reports an invariant violation and aborts the process.
///
/// The message goes both to the installed logger and directly to stderr,
/// so it survives even when no logger was set up.
pub(crate) fn fatal(msg: &str) -> ! {
    let backtrace = backtrace_to_string(64, 2, "    ");
    log::error!("{}\nbacktrace:\n{}", msg, backtrace);
    eprintln!("fatal: {}\nbacktrace:\n{}", msg, backtrace);
    std::process::abort();
}

macro_rules! fatal_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::util::fatal(&format!("assertion failed: {}", stringify!($cond)))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::util::fatal(&format!(
                "assertion failed: {}: {}",
                stringify!($cond),
                format_args!($($arg)+)
            ))
        }
    };
}
pub(crate) use fatal_assert;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(thread_id(), thread_id());
        assert!(thread_id() > 0);
    }

    #[test]
    fn thread_id_differs_across_threads() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn backtrace_lines_carry_the_prefix() {
        let bt = backtrace_to_string(8, 0, ">>> ");
        for line in bt.lines() {
            assert!(line.starts_with(">>> "), "unprefixed line: {:?}", line);
        }
    }
}
