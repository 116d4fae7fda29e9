use crate::util::lock_or_recover;
use futures_channel::oneshot;
use std::{collections::VecDeque, sync::Mutex};

/// Non-blocking counting semaphore with FIFO fairness.
///
/// [`acquire`](AsyncSemaphore::acquire) resolves as soon as a permit is free;
/// [`release`](AsyncSemaphore::release) wakes at most one waiter. With a
/// single permit the semaphore forms an async mutex, which is how the engines
/// express their critical sections: no thread ever blocks holding a lock.
///
/// Waiters are woken through oneshot channels, never while the internal guard
/// is held.
pub(crate) struct AsyncSemaphore {
    state: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    permits: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Permit returned by [`AsyncSemaphore::acquire`]; dropping it releases the
/// permit.
pub(crate) struct SemaphorePermit<'a> {
    semaphore: &'a AsyncSemaphore,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Wait for a free permit. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        let receiver = {
            let mut state = lock_or_recover(&self.state);
            if state.permits > 0 {
                state.permits -= 1;
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                Some(receiver)
            }
        };

        if let Some(receiver) = receiver {
            // the drop guard forwards the wakeup if this future is dropped
            // after the permit was granted but before it was observed
            let mut waiter = Waiter {
                semaphore: self,
                receiver: Some(receiver),
            };
            if let Some(receiver) = waiter.receiver.as_mut() {
                let _granted = receiver.await;
            }
            waiter.receiver = None;
        }

        SemaphorePermit { semaphore: self }
    }

    /// Free one permit, waking the oldest live waiter if any.
    pub fn release(&self) {
        loop {
            let waiter = {
                let mut state = lock_or_recover(&self.state);
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.permits += 1;
                        return;
                    }
                }
            };

            if waiter.send(()).is_ok() {
                return;
            }
            // the waiter was canceled while queued, hand the permit to the
            // next one
        }
    }

    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        lock_or_recover(&self.state).permits
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        lock_or_recover(&self.state).waiters.len()
    }
}

struct Waiter<'a> {
    semaphore: &'a AsyncSemaphore,
    receiver: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            // close first so a racing `release` either lands in the drain
            // below or fails over to the next waiter; a wakeup that was sent
            // but never observed must not leak the permit
            receiver.close();
            if let Ok(Some(())) = receiver.try_recv() {
                self.semaphore.release();
            }
        }
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
