use core::sync::atomic::{AtomicU32, Ordering};

/// Nesting depth of "preemption disabled" sections on one CPU.
///
/// The pmap keeps one of these per CPU. Code that hands out references
/// into page tables or per-CPU shootdown state must run with the depth
/// above zero.
#[derive(Debug, Default)]
pub struct PreemptCounter {
    depth: AtomicU32,
}

impl PreemptCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    /// Disables preemption until the guard is dropped. Nests.
    #[inline]
    pub fn disable(&self) -> PreemptGuard<'_> {
        self.depth.fetch_add(1, Ordering::Acquire);
        PreemptGuard { counter: self }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.depth.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Re-enables preemption (one level) on drop.
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct PreemptGuard<'a> {
    counter: &'a PreemptCounter,
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        let prev = self.counter.depth.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "preemption depth underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest() {
        let c = PreemptCounter::new();
        assert!(!c.is_disabled());
        {
            let _outer = c.disable();
            {
                let _inner = c.disable();
                assert_eq!(c.depth(), 2);
            }
            assert!(c.is_disabled());
        }
        assert_eq!(c.depth(), 0);
    }
}
