use crate::{SpinLock, SpinLockGuard};
use crossbeam_utils::Backoff;

/// Locks two spin locks, lower `key` first.
///
/// The guards come back in argument order regardless of acquisition order.
/// Two CPUs that each need the other's lock therefore never wait on each
/// other in a cycle.
///
/// # Panics
/// If both keys are equal; a lock cannot be taken twice.
///
/// ```rust
/// # use kernel_sync::{SpinLock, lock_pair};
/// let a = SpinLock::new(1);
/// let b = SpinLock::new(2);
/// let (ga, gb) = lock_pair((&a, 7), (&b, 3));
/// assert_eq!(*ga + *gb, 3);
/// ```
pub fn lock_pair<'a, A, B>(
    a: (&'a SpinLock<A>, u64),
    b: (&'a SpinLock<B>, u64),
) -> (SpinLockGuard<'a, A>, SpinLockGuard<'a, B>) {
    let backoff = Backoff::new();
    lock_pair_with(a, b, || backoff.spin())
}

/// [`lock_pair`], calling `relax` while waiting for either lock.
///
/// # Panics
/// If both keys are equal.
pub fn lock_pair_with<'a, A, B>(
    a: (&'a SpinLock<A>, u64),
    b: (&'a SpinLock<B>, u64),
    mut relax: impl FnMut(),
) -> (SpinLockGuard<'a, A>, SpinLockGuard<'a, B>) {
    assert_ne!(a.1, b.1, "lock_pair: same lock twice");
    if a.1 < b.1 {
        let ga = a.0.lock_with(&mut relax);
        let gb = b.0.lock_with(&mut relax);
        (ga, gb)
    } else {
        let gb = b.0.lock_with(&mut relax);
        let ga = a.0.lock_with(&mut relax);
        (ga, gb)
    }
}
