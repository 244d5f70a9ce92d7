use std::{
    cell::{Cell, RefCell},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::util::try_spawn_local;

/// Schedules removal of an unobserved cache entry after its gc window.
///
/// Armed when the entry's last observer detaches and disarmed when one
/// attaches (or the entry is removed manually). The gc window only ever
/// grows: an entry shared by observers with different `gc_time`s lives as
/// long as the most patient one asks.
pub(crate) struct GcTimer {
    gc_time: Cell<Option<Duration>>,
    handle: RefCell<Option<JoinHandle<()>>>,
}

impl GcTimer {
    pub(crate) fn new(gc_time: Duration) -> Self {
        Self {
            gc_time: Cell::new(Some(gc_time)),
            handle: RefCell::new(None),
        }
    }

    /// Keep the larger of the current and proposed windows.
    pub(crate) fn update_gc_time(&self, gc_time: Duration) {
        let current = self.gc_time.get().unwrap_or(Duration::ZERO);
        self.gc_time.set(Some(current.max(gc_time)));
    }

    pub(crate) fn gc_time(&self) -> Duration {
        self.gc_time.get().unwrap_or(Duration::ZERO)
    }

    /// Arm the timer. A no-op when already armed, or when no runtime is
    /// available to host the sleep.
    pub(crate) fn schedule(&self, on_expire: impl FnOnce() + 'static) {
        let already_armed = self
            .handle
            .borrow()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if already_armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("no local runtime; skipping gc scheduling");
            return;
        }
        // The window starts counting now, not when the task is first polled.
        let sleep = tokio::time::sleep(self.gc_time());
        let handle = try_spawn_local(async move {
            sleep.await;
            on_expire();
        });
        if let Some(handle) = handle {
            *self.handle.borrow_mut() = Some(handle);
        }
    }

    /// Disarm the timer if armed.
    pub(crate) fn clear(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::run_paused;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn fires_after_the_gc_window() {
        run_paused(async {
            let timer = GcTimer::new(Duration::from_secs(10));
            let fired = Rc::new(Cell::new(false));
            {
                let fired = fired.clone();
                timer.schedule(move || fired.set(true));
            }
            tokio::time::advance(Duration::from_secs(9)).await;
            tokio::task::yield_now().await;
            assert!(!fired.get());
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
            assert!(fired.get());
        });
    }

    #[test]
    fn clear_disarms_a_pending_timer() {
        run_paused(async {
            let timer = GcTimer::new(Duration::from_secs(1));
            let fired = Rc::new(Cell::new(false));
            {
                let fired = fired.clone();
                timer.schedule(move || fired.set(true));
            }
            timer.clear();
            tokio::time::advance(Duration::from_secs(5)).await;
            tokio::task::yield_now().await;
            assert!(!fired.get());
        });
    }

    #[test]
    fn gc_time_only_grows() {
        let timer = GcTimer::new(Duration::from_secs(10));
        timer.update_gc_time(Duration::from_secs(5));
        assert_eq!(timer.gc_time(), Duration::from_secs(10));
        timer.update_gc_time(Duration::from_secs(20));
        assert_eq!(timer.gc_time(), Duration::from_secs(20));
    }

    #[test]
    fn scheduling_outside_a_runtime_is_a_no_op() {
        let timer = GcTimer::new(Duration::ZERO);
        timer.schedule(|| {});
        timer.clear();
    }
}
