use crate::executor::{sleep, spawn};
use futures_channel::oneshot;
use futures_util::{
    future::{self, Either},
    pin_mut,
};
use std::time::Duration;

/// One-shot watchdog: runs `action` after `delay` unless disarmed first.
///
/// Dropping the watchdog disarms it.
pub(crate) struct Watchdog {
    cancellation: Option<oneshot::Sender<()>>,
}

impl Watchdog {
    pub fn arm<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancellation, canceled) = oneshot::channel::<()>();

        spawn(async move {
            let delay = sleep(delay);
            pin_mut!(delay);
            if let Either::Left(_) = future::select(delay, canceled).await {
                action();
            }
        });

        Self {
            cancellation: Some(cancellation),
        }
    }

    pub fn disarm(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancellation) = self.cancellation.take() {
            let _result = cancellation.send(());
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
