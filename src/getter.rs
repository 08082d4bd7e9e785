use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::pool::{Pool, Pooled};

/// Acquires values from a [`Pool`] and releases all of them in one call.
///
/// Releases run in reverse acquisition order, the way nested scopes unwind.
/// Values still held when the getter is dropped are released then.
///
/// ```rust
/// use futures_backlog::Pool;
///
/// let pool = Pool::new(4, || vec![0u8; 16]);
/// let mut getter = pool.getter();
/// let header = getter.get();
/// header[0] = 1;
/// let body = getter.get();
/// body[0] = 2;
/// assert_eq!(pool.in_use(), 2);
///
/// assert_eq!(getter.release_all(), 2);
/// assert_eq!(pool.in_use(), 0);
/// ```
pub struct Getter<'p, T> {
  pool: &'p Pool<T>,
  chain: Mutex<Vec<Pooled<'p, T>>>,
}

impl<T> fmt::Debug for Getter<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Getter")
      .field("held", &self.chain.lock().len())
      .finish_non_exhaustive()
  }
}

impl<'p, T> Getter<'p, T> {
  pub(crate) fn new(pool: &'p Pool<T>) -> Self {
    Self {
      pool,
      chain: Mutex::new(Vec::new()),
    }
  }

  /// Acquire a value and push its release onto the chain.
  ///
  /// May be called from several threads sharing the getter. The returned
  /// borrows all end before [`Getter::release_all`] can run.
  #[allow(clippy::mut_from_ref)]
  pub fn get(&self) -> &mut T {
    let mut pooled = self.pool.get();
    let ptr = pooled.as_mut_ptr();
    self.chain.lock().push(pooled);
    // SAFETY: `ptr` points into a slot claimed by `pooled` or into its own
    // heap allocation; neither moves while `pooled` sits in the chain, and
    // no other borrow of it is handed out. `release_all` and `Drop` need
    // `&mut self`, so the reference cannot outlive the claim.
    unsafe { &mut *ptr }
  }

  /// Number of values acquired since the last `release_all`.
  pub fn held(&self) -> usize {
    self.chain.lock().len()
  }

  /// Release every value acquired so far, most recent first, and reset the
  /// chain. Returns how many went back into pool slots.
  pub fn release_all(&mut self) -> usize {
    self.unwind(|_, _| {})
  }

  /// Releases the chain newest first, showing each value to `visit` along
  /// with whether it went back into the pool.
  pub(crate) fn unwind(&mut self, mut visit: impl FnMut(&T, bool)) -> usize {
    let chain = std::mem::take(&mut *self.chain.lock());
    let total = chain.len();
    let mut recycled = 0;
    for pooled in chain.into_iter().rev() {
      let pooled_slot = pooled.is_pooled();
      visit(&*pooled, pooled_slot);
      if pooled.release() {
        recycled += 1;
      }
    }
    if total > 0 {
      trace!(total, recycled, "Released getter chain.");
    }
    recycled
  }
}

impl<T> Drop for Getter<'_, T> {
  fn drop(&mut self) {
    self.release_all();
  }
}
