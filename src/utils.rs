//! Small helpers shared by more than one component.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tokio::task::JoinHandle;

/// A [`JoinHandle`] that aborts its task when dropped, so a `Controller`'s
/// worker/source tasks never outlive the handle that's supposed to be
/// supervising them.
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> CancelableJoinHandle<T>
where
    T: Send + 'static,
{
    pub fn spawn(future: impl Future<Output = T> + Send + 'static) -> Self {
        CancelableJoinHandle {
            inner: tokio::spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// A token-bucket admission limiter: `rate` tokens/s refilled continuously up
/// to `burst` capacity. Used to cap overall reconciliation pressure across an
/// arbitrary number of concurrent workers (spec §4.4).
pub struct AdmissionLimiter {
    state: parking_lot::Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl AdmissionLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        AdmissionLimiter {
            state: parking_lot::Mutex::new(BucketState {
                tokens: burst,
                last_refill: tokio::time::Instant::now(),
            }),
            rate: rate_per_sec,
            burst,
        }
    }

    /// Blocks until a token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = tokio::time::Instant::now();
                let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(std::time::Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

impl Default for AdmissionLimiter {
    /// 10 requests/s steady, burst 100 (spec §4.1/§4.4 default).
    fn default() -> Self {
        AdmissionLimiter::new(10.0, 100.0)
    }
}
