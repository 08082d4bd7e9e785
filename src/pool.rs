use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::*;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::getter::Getter;

struct Slot<T> {
  value: UnsafeCell<T>,
  /// Set while a `Pooled` holds this slot.
  taken: AtomicBool,
}

/// A fixed-capacity pool of reusable values.
///
/// Every slot is built up front by the constructor. [`Pool::get`] picks a
/// slot round-robin and claims it with a single compare-and-swap; if that
/// slot is already held the constructor runs again and the caller gets a
/// fresh value that is discarded instead of recycled on release. `get`
/// never blocks and never fails.
///
/// # Examples
///
/// ```rust
/// use futures_backlog::Pool;
///
/// let pool = Pool::new(2, || Vec::<u8>::with_capacity(1024));
/// let mut buf = pool.get();
/// buf.extend_from_slice(b"hello");
/// assert!(buf.is_pooled());
/// assert!(buf.release());
/// assert_eq!(pool.in_use(), 0);
/// ```
pub struct Pool<T> {
  slots: Box<[Slot<T>]>,
  constructor: Box<dyn Fn() -> T + Send + Sync>,
  /// Round-robin cursor, reduced modulo capacity. Wraps to zero past
  /// `usize::MAX`; unless capacity is a power of two, the rotation repeats
  /// or skips one slot at that point.
  next: AtomicUsize,
  diagnostics: AtomicBool,
  callers: DashMap<usize, Backtrace>,
}

// Slot contents are only reachable through the `Pooled` that won the claim.
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> fmt::Debug for Pool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("capacity", &self.capacity())
      .field("in_use", &self.in_use())
      .field("diagnostics", &self.diagnostics.load(Relaxed))
      .finish_non_exhaustive()
  }
}

impl<T> Pool<T> {
  /// Create a pool of `capacity` slots, calling `constructor` once per slot.
  ///
  /// A capacity of zero is allowed; such a pool constructs a fresh value on
  /// every `get`.
  pub fn new<F>(capacity: usize, constructor: F) -> Self
  where
    F: Fn() -> T + Send + Sync + 'static,
  {
    let slots = (0..capacity)
      .map(|_| Slot {
        value: UnsafeCell::new(constructor()),
        taken: AtomicBool::new(false),
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self {
      slots,
      constructor: Box::new(constructor),
      next: AtomicUsize::new(0),
      diagnostics: AtomicBool::new(false),
      callers: DashMap::new(),
    }
  }

  /// Enable or disable acquisition-site capture, builder style.
  pub fn with_diagnostics(self, enabled: bool) -> Self {
    self.set_diagnostics(enabled);
    self
  }

  /// When enabled, every slot claim records a backtrace of the caller that
  /// is kept until the slot is released. See [`Pool::callers`].
  pub fn set_diagnostics(&self, enabled: bool) {
    self.diagnostics.store(enabled, Relaxed);
    if !enabled {
      self.callers.clear();
    }
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Number of slots currently claimed. Unpooled overflow values are not counted.
  pub fn in_use(&self) -> usize {
    self.slots.iter().filter(|slot| slot.taken.load(Relaxed)).count()
  }

  /// Backtraces of outstanding slot claims made while diagnostics were on,
  /// ordered by slot index.
  pub fn callers(&self) -> Vec<(usize, String)> {
    let mut callers: Vec<(usize, String)> = self
      .callers
      .iter()
      .map(|entry| (*entry.key(), entry.value().to_string()))
      .collect();
    callers.sort_by_key(|(index, _)| *index);
    callers
  }

  /// Take a value from the pool.
  ///
  /// The returned guard gives the value back when released or dropped.
  /// If the selected slot is busy, the guard owns a freshly constructed
  /// value instead and [`Pooled::release`] reports `false`.
  pub fn get(&self) -> Pooled<'_, T> {
    let capacity = self.slots.len();
    if capacity > 0 {
      let index = self.next.fetch_add(1, Relaxed) % capacity;
      let slot = &self.slots[index];
      if slot.taken.compare_exchange(false, true, Acquire, Relaxed).is_ok() {
        if self.diagnostics.load(Relaxed) {
          self.callers.insert(index, Backtrace::force_capture());
        }
        trace!(index, "Claimed pool slot.");
        return Pooled {
          pool: self,
          lease: Some(Lease::Slot(index)),
          _marker: PhantomData,
        };
      }
      debug!(index, capacity, "Pool slot busy, constructing an unpooled value.");
    }

    let fresh = Box::new((self.constructor)());
    Pooled {
      pool: self,
      lease: Some(Lease::Fresh(NonNull::from(Box::leak(fresh)))),
      _marker: PhantomData,
    }
  }

  /// Start a chain of acquisitions that are released together, most recent first.
  pub fn getter(&self) -> Getter<'_, T> {
    Getter::new(self)
  }

  fn release_slot(&self, index: usize) {
    if self.diagnostics.load(Relaxed) {
      self.callers.remove(&index);
    }
    trace!(index, "Released pool slot.");
    self.slots[index].taken.store(false, Release);
  }
}

enum Lease<T> {
  Slot(usize),
  /// Owned through `Box::leak`; freed on release.
  Fresh(NonNull<T>),
}

/// A value borrowed from a [`Pool`].
///
/// Dereferences to the value. Dropping the guard has the same effect as
/// calling [`Pooled::release`] and ignoring the result.
pub struct Pooled<'a, T> {
  pool: &'a Pool<T>,
  lease: Option<Lease<T>>,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Pooled<'_, T> {}
unsafe impl<T: Sync> Sync for Pooled<'_, T> {}

impl<T> Pooled<'_, T> {
  /// `true` if this value lives in a pool slot, `false` for an overflow value.
  pub fn is_pooled(&self) -> bool {
    matches!(self.lease, Some(Lease::Slot(_)))
  }

  pub fn slot_index(&self) -> Option<usize> {
    match self.lease {
      Some(Lease::Slot(index)) => Some(index),
      _ => None,
    }
  }

  /// Give the value back.
  ///
  /// Returns `true` if it went back into its slot, or `false` if it was an
  /// unpooled overflow value, which is dropped here.
  pub fn release(mut self) -> bool {
    self.release_lease()
  }

  pub(crate) fn as_mut_ptr(&mut self) -> *mut T {
    match self.lease {
      Some(Lease::Slot(index)) => self.pool.slots[index].value.get(),
      Some(Lease::Fresh(ptr)) => ptr.as_ptr(),
      None => unreachable!("pooled value used after release"),
    }
  }

  fn release_lease(&mut self) -> bool {
    match self.lease.take() {
      Some(Lease::Slot(index)) => {
        self.pool.release_slot(index);
        true
      }
      Some(Lease::Fresh(ptr)) => {
        // SAFETY: `ptr` came from `Box::leak` in `Pool::get` and is freed only here.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        false
      }
      None => false,
    }
  }
}

impl<T> Deref for Pooled<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    let ptr = match self.lease {
      Some(Lease::Slot(index)) => self.pool.slots[index].value.get() as *const T,
      Some(Lease::Fresh(ptr)) => ptr.as_ptr() as *const T,
      None => unreachable!("pooled value used after release"),
    };
    // SAFETY: the slot claim or the leaked box gives this guard exclusive access.
    unsafe { &*ptr }
  }
}

impl<T> DerefMut for Pooled<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: as in `deref`, and `&mut self` rules out other borrows through this guard.
    unsafe { &mut *self.as_mut_ptr() }
  }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pooled")
      .field("slot", &self.slot_index())
      .field("value", &**self)
      .finish()
  }
}

impl<T> Drop for Pooled<'_, T> {
  fn drop(&mut self) {
    self.release_lease();
  }
}
