//! Removal handshake between the control and render threads
//!
//! Every object shared with the render side carries a [`Lifecycle`]:
//!
//! 1. The control side stores `Removed`. No command is needed.
//! 2. The render side stops using the object, hands it back for release and
//!    stores `Safe`.
//! 3. The control side forgets its handle once it observes `Safe`.
//!
//! Memory is therefore never released while a render tick may still touch it.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Live = 0,
    Removed = 1,
    Safe = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::Removed,
            _ => Self::Safe,
        }
    }
}

#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Live as u8))
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_live(&self) -> bool {
        self.state() == LifecycleState::Live
    }

    pub fn is_removed(&self) -> bool {
        self.state() == LifecycleState::Removed
    }

    pub fn is_safe(&self) -> bool {
        self.state() == LifecycleState::Safe
    }

    /// Request removal. Returns `false` if removal was already requested.
    pub fn mark_removed(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::Live as u8,
                LifecycleState::Removed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Render side acknowledgement: the object is no longer referenced.
    pub fn mark_safe(&self) {
        self.0.store(LifecycleState::Safe as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let lc = Lifecycle::new();
        assert!(lc.is_live());

        assert!(lc.mark_removed());
        assert!(lc.is_removed());
        assert!(!lc.mark_removed());

        lc.mark_safe();
        assert!(lc.is_safe());
        assert!(!lc.mark_removed());
    }
}
