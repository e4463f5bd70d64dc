use crate::error::Failure;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Cleanup callback returned by an effect body
///
/// A cleanup runs at most once: before the next run of the same effect, or when
/// the owning instance is destroyed.
///
/// # Example
/// ```
/// use hookflow::Cleanup;
///
/// let cleanup = Cleanup::new(|| println!("unsubscribed"));
/// drop(cleanup); // dropping without running is allowed, nothing is printed
/// ```
pub struct Cleanup(Box<dyn FnOnce() + Send>);

impl Cleanup {
    /// Wrap a callback.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Cleanup(Box::new(f))
    }

    /// Run the callback, isolating a panic into a [`Failure`].
    pub(crate) fn invoke(self) -> Result<(), Failure> {
        catch_unwind(AssertUnwindSafe(self.0)).map_err(Failure::from_panic)
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

/// What an effect body may return.
///
/// Implemented for:
/// - `()`: no cleanup
/// - [`Cleanup`]
/// - `Option<Cleanup>`
/// - `Result<T, E>` where `T: IntoCleanup`; `Err` is reported as a body failure
pub trait IntoCleanup {
    /// Convert into an optional cleanup, or the failure of the body.
    fn into_cleanup(self) -> Result<Option<Cleanup>, Failure>;
}

impl IntoCleanup for () {
    fn into_cleanup(self) -> Result<Option<Cleanup>, Failure> {
        Ok(None)
    }
}

impl IntoCleanup for Cleanup {
    fn into_cleanup(self) -> Result<Option<Cleanup>, Failure> {
        Ok(Some(self))
    }
}

impl IntoCleanup for Option<Cleanup> {
    fn into_cleanup(self) -> Result<Option<Cleanup>, Failure> {
        Ok(self)
    }
}

impl<T, E> IntoCleanup for Result<T, E>
where
    T: IntoCleanup,
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_cleanup(self) -> Result<Option<Cleanup>, Failure> {
        match self {
            Ok(value) => value.into_cleanup(),
            Err(err) => Err(Failure::Returned(Box::new(err))),
        }
    }
}

/// Type-erased effect body waiting in a run queue.
pub(crate) struct EffectBody(Box<dyn FnOnce() -> Result<Option<Cleanup>, Failure> + Send>);

impl EffectBody {
    pub(crate) fn new<F, C>(f: F) -> Self
    where
        F: FnOnce() -> C + Send + 'static,
        C: IntoCleanup,
    {
        EffectBody(Box::new(move || f().into_cleanup()))
    }

    /// Run the body. Panics and returned errors both become a [`Failure`].
    pub(crate) fn invoke(self) -> Result<Option<Cleanup>, Failure> {
        catch_unwind(AssertUnwindSafe(self.0))
            .unwrap_or_else(|payload| Err(Failure::from_panic(payload)))
    }
}

impl fmt::Debug for EffectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EffectBody")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("offline")]
    struct Offline;

    #[test]
    fn body_returning_unit_has_no_cleanup() {
        let result = EffectBody::new(|| ()).invoke();
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn body_returning_cleanup_hands_it_back() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let cleanup = EffectBody::new(move || {
            Cleanup::new(move || {
                count_clone.fetch_add(1, Ordering::Relaxed);
            })
        })
        .invoke()
        .unwrap()
        .unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 0);
        cleanup.invoke().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn returned_error_is_a_failure() {
        let result = EffectBody::new(|| -> Result<(), Offline> { Err(Offline) }).invoke();
        assert!(matches!(result, Err(Failure::Returned(_))));
    }

    #[test]
    fn panicking_body_is_caught() {
        let result = EffectBody::new(|| -> () { panic!("kaboom") }).invoke();
        assert!(matches!(result, Err(Failure::Panicked(ref m)) if m == "kaboom"));
    }

    #[test]
    fn panicking_cleanup_is_caught() {
        let result = Cleanup::new(|| panic!("in cleanup")).invoke();
        assert!(matches!(result, Err(Failure::Panicked(ref m)) if m == "in cleanup"));
    }
}
