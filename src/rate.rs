//! Pacing and concurrency limits for outbound sends.
//!
//! Two independent knobs: a fixed delay of `1 / rate` seconds taken by every
//! unit before it asks for a slot, and a semaphore capping in-flight sends.
//! The delay is per unit, not a shared token bucket, so with many units
//! sleeping at once the semaphore is what actually bounds throughput.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    rate: u32,
    concurrency: usize,
}

impl RateConfig {
    /// Messages per second and maximum in-flight sends; both are at least 1.
    pub fn new(rate: u32, concurrency: usize) -> Self {
        Self {
            rate: rate.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate))
    }
}

#[derive(Debug, Clone)]
pub struct RateController {
    delay: Duration,
    slots: Arc<Semaphore>,
}

impl RateController {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            delay: cfg.pacing_delay(),
            slots: Arc::new(Semaphore::new(cfg.concurrency())),
        }
    }

    pub async fn pace(&self) {
        tokio::time::sleep(self.delay).await;
    }

    /// Wait for a free send slot. The slot is returned when the permit drops.
    /// Fails only after [`RateController::close`].
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.slots.clone().acquire_owned().await
    }

    /// Stop handing out slots. Waiting and future acquires fail; permits
    /// already held stay valid until dropped.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
