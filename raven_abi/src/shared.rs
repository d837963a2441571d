//! Joint ownership protocol for entity hosts.
//!
//! Each entity host is owned by both the host process and the extender. The
//! factory hands the host a [`SharedBlock`] alongside the new object; either
//! side releases through it, and whoever drops the count to zero triggers
//! the deleter, which must perform the destructor-then-free sequence exactly
//! once. A double free or use after free here is the highest-severity hazard
//! in the whole extender, so the decrement is atomic and guarded against
//! underflow even though the host is assumed to call from a single logical
//! context.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

/// Release callback supplied by the extender at construction. Runs the
/// target's teardown and frees it; called at most once per block.
pub type SharedDeleteFn = unsafe extern "C" fn(block: *mut SharedBlock);

#[repr(C)]
pub struct SharedBlock {
    refs: AtomicU32,
    deleter: SharedDeleteFn,
    target: *mut c_void,
}

impl SharedBlock {
    /// Allocate a block with `refs` initial references. The count reflects
    /// every holder: the host's reference plus the extender's.
    pub fn allocate(refs: u32, deleter: SharedDeleteFn, target: *mut c_void) -> *mut SharedBlock {
        Box::into_raw(Box::new(SharedBlock {
            refs: AtomicU32::new(refs),
            deleter,
            target,
        }))
    }

    pub fn target(&self) -> *mut c_void {
        self.target
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Add one reference. Null blocks are ignored.
///
/// # Safety
/// `block` must be null or a pointer previously returned by
/// [`SharedBlock::allocate`] that has not yet been freed.
pub unsafe fn retain(block: *mut SharedBlock) {
    if block.is_null() {
        return;
    }
    (*block).refs.fetch_add(1, Ordering::AcqRel);
}

/// Drop one reference. Reaching zero runs the deleter and then frees the
/// block itself; returns true in that case. Releasing a block already at
/// zero is a guarded no-op: the count never underflows.
///
/// # Safety
/// Same requirements as [`retain`]; additionally the caller must not touch
/// `block` or its target again once this returns true.
pub unsafe fn release(block: *mut SharedBlock) -> bool {
    if block.is_null() {
        return false;
    }
    let previous = (*block)
        .refs
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            count.checked_sub(1)
        });
    if previous == Ok(1) {
        let deleter = (*block).deleter;
        deleter(block);
        drop(Box::from_raw(block));
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DELETIONS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_deleter(_block: *mut SharedBlock) {
        DELETIONS.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn noop_deleter(_block: *mut SharedBlock) {}

    #[test]
    fn deleter_runs_exactly_once_at_zero() {
        DELETIONS.store(0, Ordering::SeqCst);
        let block = SharedBlock::allocate(2, counting_deleter, std::ptr::null_mut());
        unsafe {
            assert!(!release(block));
            assert_eq!(DELETIONS.load(Ordering::SeqCst), 0);
            assert!(release(block));
        }
        assert_eq!(DELETIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_from_zero_is_guarded() {
        let block = SharedBlock::allocate(0, noop_deleter, std::ptr::null_mut());
        unsafe {
            assert!(!release(block));
            assert!(!release(block));
            assert_eq!((*block).refs(), 0);
            // Block was never handed to a deleter; reclaim it manually.
            drop(Box::from_raw(block));
        }
    }

    #[test]
    fn retain_then_release_balances() {
        DELETIONS.store(0, Ordering::SeqCst);
        let block = SharedBlock::allocate(1, counting_deleter, std::ptr::null_mut());
        unsafe {
            retain(block);
            assert_eq!((*block).refs(), 2);
            assert!(!release(block));
            assert!(release(block));
        }
        assert_eq!(DELETIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_block_is_ignored() {
        unsafe {
            retain(std::ptr::null_mut());
            assert!(!release(std::ptr::null_mut()));
        }
    }
}
