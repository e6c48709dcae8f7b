//! Weak default layer for SCSI-side host helpers.
//!
//! Handlers built for a richer SCSI-capable host may call entry points this
//! gateway does not drive: unmap geometry, extended-copy limits, lock-lost
//! notification, configfs attribute getters, logfile helpers. Each one
//! returns a neutral value, logging a backtrace on its first and second
//! invocation and staying silent afterwards.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use log::warn;
use parking_lot::Mutex;

static CALLS: Mutex<BTreeMap<&'static str, u64>> = Mutex::new(BTreeMap::new());

fn trace(name: &'static str) {
    let mut calls = CALLS.lock();
    let n = calls.entry(name).or_insert(0);
    *n += 1;
    if *n <= 2 {
        warn!(
            "stubbed host call {} (invocation {}) from:\n{}",
            name,
            n,
            Backtrace::force_capture()
        );
    }
}

#[cfg(test)]
fn call_count(name: &str) -> u64 {
    CALLS.lock().get(name).copied().unwrap_or(0)
}

/// Unmap granularity in blocks; this host never unmaps.
pub fn unmap_granularity(_minor: u16) -> u64 {
    trace("unmap_granularity");
    0
}

/// Unmap granularity alignment in blocks.
pub fn unmap_granularity_alignment(_minor: u16) -> u64 {
    trace("unmap_granularity_alignment");
    0
}

/// Largest extended-copy segment the host would accept; none here.
pub fn max_xcopy_len(_minor: u16) -> u64 {
    trace("max_xcopy_len");
    0
}

/// Device lock was lost on a richer host; nothing to recover here.
pub fn lock_lost(_minor: u16) {
    trace("lock_lost");
}

/// Configfs attribute getter; no configfs is attached.
pub fn get_attribute(_minor: u16, _name: &str) -> i64 {
    trace("get_attribute");
    -1
}

/// Whether a handler logfile was configured.
pub fn logfile_configured() -> bool {
    trace("logfile_configured");
    false
}

/// Create a handler log directory; reports success without creating one.
pub fn logdir_create(_path: &str) -> bool {
    trace("logdir_create");
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_every_invocation() {
        assert_eq!(call_count("get_attribute"), 0);
        for _ in 0..3 {
            assert_eq!(get_attribute(0, "emulate_write_cache"), -1);
        }
        assert_eq!(call_count("get_attribute"), 3);
    }

    #[test]
    fn neutral_values() {
        assert_eq!(unmap_granularity(5), 0);
        assert_eq!(max_xcopy_len(5), 0);
        assert!(!logfile_configured());
        lock_lost(5);
    }
}
