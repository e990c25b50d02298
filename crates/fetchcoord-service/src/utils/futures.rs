/// Runs a closure when dropped, unless [disarmed](Self::disarm) first.
///
/// Use this to undo work when a future is dropped before it resolves. The closure runs during
/// drop, so it must not panic.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct CallOnDrop<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> CallOnDrop<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    /// Drops the guard without running its closure.
    pub fn disarm(mut self) {
        self.f = None;
    }
}

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let called = Cell::new(false);
        drop(CallOnDrop::new(|| called.set(true)));
        assert!(called.get());
    }

    #[test]
    fn test_disarm() {
        let called = Cell::new(false);
        CallOnDrop::new(|| called.set(true)).disarm();
        assert!(!called.get());
    }
}
