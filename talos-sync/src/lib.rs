//! Spinlock-based mutual exclusion primitives for the memory management core.
//!
//! Every shared-state module in this core (the physical frame allocator, the
//! VMM's bookkeeping, each slab cache, the buddy allocator) is guarded by one
//! [`Mutex`] of its own. There is no blocking, no priority inheritance, and no
//! fairness guarantee: a contended [`Mutex::lock`] spins with a
//! [`core::hint::spin_loop`] pause hint until the lock is released.
#![cfg_attr(not(test), no_std)]

use core::{
	cell::UnsafeCell,
	fmt,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicBool, Ordering},
};

/// A test-and-set spinlock protecting a value of type `T`.
///
/// Unlike the unfair, `unsafe`-to-acquire spinlock some kernels use for their
/// hottest paths, [`Mutex`] exposes a safe API: the borrow checker, not the
/// caller, is responsible for not re-entering a lock already held on the same
/// core. Re-entrant acquisition spins forever, exactly as it would with
/// `std::sync::Mutex` on a platform without recursive mutexes.
pub struct Mutex<T: ?Sized> {
	/// Whether the lock is currently held.
	locked: AtomicBool,
	/// The protected value.
	value: UnsafeCell<T>,
}

// SAFETY: Access to `value` is only ever granted through a `MutexGuard`,
// SAFETY: which is only handed out once `locked` has been test-and-set.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
	/// Creates a new, unlocked `Mutex` wrapping `value`.
	#[inline]
	#[must_use]
	pub const fn new(value: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			value: UnsafeCell::new(value),
		}
	}

	/// Consumes the mutex, returning the wrapped value.
	#[inline]
	pub fn into_inner(self) -> T {
		self.value.into_inner()
	}
}

impl<T: ?Sized> Mutex<T> {
	/// Acquires the lock, spinning until it becomes available.
	///
	/// The CPU is given a `pause`-equivalent hint ([`core::hint::spin_loop`])
	/// on every failed attempt so hyper-threaded siblings aren't starved of
	/// the execution unit.
	#[inline]
	pub fn lock(&self) -> MutexGuard<'_, T> {
		loop {
			if let Some(guard) = self.try_lock() {
				return guard;
			}
			while self.locked.load(Ordering::Relaxed) {
				core::hint::spin_loop();
			}
		}
	}

	/// Attempts to acquire the lock without spinning.
	///
	/// Returns `None` immediately if the lock is currently held.
	#[inline]
	#[must_use]
	pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
		self.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.ok()
			.map(|()| MutexGuard { lock: self })
	}

	/// Returns a mutable reference to the underlying data, bypassing the
	/// lock. Sound only because `&mut self` statically proves no other
	/// reference (locked or otherwise) can exist.
	#[inline]
	pub fn get_mut(&mut self) -> &mut T {
		self.value.get_mut()
	}
}

impl<T: ?Sized + Default> Default for Mutex<T> {
	#[inline]
	fn default() -> Self {
		Self::new(T::default())
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.try_lock() {
			Some(guard) => f.debug_struct("Mutex").field("value", &*guard).finish(),
			None => f.debug_struct("Mutex").field("value", &"<locked>").finish(),
		}
	}
}

/// An RAII guard granting exclusive access to a [`Mutex`]'s contents.
///
/// The lock is released when the guard is dropped.
pub struct MutexGuard<'a, T: ?Sized> {
	/// The lock this guard was checked out from.
	lock: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		// SAFETY: holding a `MutexGuard` proves exclusive ownership of the lock.
		unsafe { &*self.lock.value.get() }
	}
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
	#[inline]
	fn deref_mut(&mut self) -> &mut T {
		// SAFETY: holding a `MutexGuard` proves exclusive ownership of the lock.
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
	#[inline]
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_unlock_round_trip() {
		let m = Mutex::new(5_i32);
		{
			let mut guard = m.lock();
			*guard += 1;
		}
		assert_eq!(*m.lock(), 6);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let m = Mutex::new(0_u8);
		let guard = m.lock();
		assert!(m.try_lock().is_none());
		drop(guard);
		assert!(m.try_lock().is_some());
	}

	#[test]
	fn contended_across_threads() {
		extern crate std;
		use std::{sync::Arc, thread};

		let m = Arc::new(Mutex::new(0_u64));
		let mut handles = std::vec::Vec::new();
		for _ in 0..8 {
			let m = Arc::clone(&m);
			handles.push(thread::spawn(move || {
				for _ in 0..1000 {
					*m.lock() += 1;
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(*m.lock(), 8000);
	}
}
