/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Helps manage "interruptable" things across our various crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Represents the state of something that may be interrupted. Decoupled from
/// the handle that requests the interruption so that code which only wants to
/// check whether it should keep going doesn't need to know about the
/// interrupt mechanics.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> std::result::Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// A shared flag that can be raised from one thread while a long-running
/// operation on another thread polls it between units of work.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Lower the flag again, so the handle can be reused for the next
    /// operation.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Interruptee for InterruptHandle {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A convenience implementation, should only be used in tests.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// The error returned by err_if_interrupted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The operation was interrupted.")]
pub struct Interrupted;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        let handle = InterruptHandle::new();
        assert!(!handle.was_interrupted());
        assert!(handle.err_if_interrupted().is_ok());

        let other = handle.clone();
        other.interrupt();
        assert!(handle.was_interrupted());
        assert_eq!(handle.err_if_interrupted(), Err(Interrupted));

        handle.clear();
        assert!(!handle.was_interrupted());
    }

    #[test]
    fn test_never_interrupts() {
        assert!(!NeverInterrupts.was_interrupted());
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }
}
