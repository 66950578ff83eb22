//! Context switches tracking utilities.
//!
//! Those are mostly used for testing, and by the channel layer to detect a
//! first write with no context switch since the channel's creation.

use std::future::Future;

use crate::runtime;

/// Returns the number of context switches (resumes) of the calling fiber, or
/// 0 outside of a fiber.
pub fn csw() -> u64 {
    runtime::driver()
        .and_then(|d| {
            let id = d.current_fiber()?;
            Some(d.fiber_csw(id))
        })
        .unwrap_or(0)
}

/// Awaits a future and checks whether the calling fiber yielded doing so.
///
/// It's mostly useful in tests.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use strand::fiber;
/// use strand::fiber::YieldResult::*;
///
/// # strand::run(async {
/// assert_eq!(
///     fiber::check_yield(fiber::sleep(Duration::ZERO)).await,
///     Yielded(())
/// );
/// # }).unwrap();
/// ```
pub async fn check_yield<F>(f: F) -> YieldResult<F::Output>
where
    F: Future,
{
    let csw_before = csw();
    let res = f.await;
    if csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The future completed without suspending the fiber.
    DidntYield(T),
    /// The fiber yielded at least once.
    Yielded(T),
}

#[cfg(test)]
mod tests {
    use super::YieldResult;
    use crate::fiber;
    use crate::runtime::run;
    use std::time::Duration;

    #[test]
    fn check_yield() {
        run(async {
            assert_eq!(
                fiber::check_yield(async {}).await, //
                YieldResult::DidntYield(())
            );
            assert_eq!(
                fiber::check_yield(fiber::sleep(Duration::ZERO)).await,
                YieldResult::Yielded(())
            );
        })
        .unwrap();
    }

    #[test]
    fn csw_counts_resumes() {
        run(async {
            let before = fiber::csw();
            fiber::yield_now().await;
            fiber::yield_now().await;
            assert_eq!(fiber::csw(), before + 2);
        })
        .unwrap();
    }
}
