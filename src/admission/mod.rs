//! # Admission Control
//!
//! Caps the number of concurrent connections. A connection holds a [`Permit`]
//! for its whole life; dropping the permit frees the slot, so every way out
//! of a connection handler releases it exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Admission {
    active: AtomicUsize,
    max: usize,
}

impl Admission {
    /// `max` of zero means unlimited.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Reserves a slot, or returns `None` when the limit is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max > 0 && active > self.max {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Permit {
            admission: self.clone(),
        })
    }

    /// Connections currently holding a permit.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A reserved connection slot, released on drop.
#[derive(Debug)]
pub struct Permit {
    admission: Arc<Admission>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.admission.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_over_limit_and_frees_on_drop() {
        let admission = Admission::new(2);
        let a = admission.try_acquire().unwrap();
        let _b = admission.try_acquire().unwrap();
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.active(), 2);

        drop(a);
        assert_eq!(admission.active(), 1);
        let _c = admission.try_acquire().unwrap();
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.active(), 2);
    }

    #[test]
    fn zero_means_unlimited() {
        let admission = Admission::new(0);
        let permits: Vec<_> = (0..100).map(|_| admission.try_acquire().unwrap()).collect();
        assert_eq!(admission.active(), 100);
        drop(permits);
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        let admission = Admission::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || admission.try_acquire())
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert!(!permits.is_empty() && permits.len() <= 4);
        assert_eq!(admission.active(), permits.len());
    }
}
