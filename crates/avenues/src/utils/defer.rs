/// Guard that runs a closure when dropped.
///
/// The closure also runs when the guard is dropped during unwinding or when the future owning it
/// is aborted, which makes it suitable for cleaning up bookkeeping of spawned tasks.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> DeferGuard<F> {
    /// Disarms the guard so that the closure never runs.
    pub fn cancel(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}
