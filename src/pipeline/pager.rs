//! Alert dispatch to the clinical response pager
//!
//! ## Endpoint
//!
//! `POST http://<PAGER_ADDRESS>/page` with a `text/plain` body of
//! `<mrn>,<test time>` (or just `<mrn>`). Any 2xx status is success.
//!
//! ## Delivery
//!
//! The store's `mark_paged` is the source of truth for "already alerted":
//! a request only reaches this module after that transition succeeded.
//! Pages run on their own tasks so a slow pager never delays the next ACK.

use super::db::PatientStore;
use super::errors::AlertDeliveryError;
use super::metrics::{PAGE_FAILED, PAGE_RESPONSE_NOT_2XX};
use super::types::Mrn;
use crate::stream_core::error_handler::ExponentialBackoff;
use async_trait::async_trait;
use metrics::increment_counter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// End-to-end budget from frame receipt to page dispatch
pub const LATENCY_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub mrn: Mrn,
    /// OBR-7 of the triggering result, as received
    pub test_time: Option<String>,
    pub received_at: Instant,
}

impl PageRequest {
    pub fn body(&self) -> String {
        match &self.test_time {
            Some(t) => format!("{},{}", self.mrn, t),
            None => self.mrn.to_string(),
        }
    }
}

/// One delivery attempt against the paging endpoint
#[async_trait]
pub trait Pager: Send + Sync {
    async fn send_page(&self, request: &PageRequest) -> Result<(), String>;
}

pub struct HttpPager {
    client: reqwest::Client,
    url: String,
}

impl HttpPager {
    pub fn new(pager_address: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{}/page", pager_address),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Pager for HttpPager {
    async fn send_page(&self, request: &PageRequest) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(request.body())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            increment_counter!(PAGE_RESPONSE_NOT_2XX);
            return Err(format!("pager responded {}", response.status()));
        }
        Ok(())
    }
}

/// Retry policy for page delivery
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

pub struct AlertDispatcher {
    pager: Arc<dyn Pager>,
    policy: RetryPolicy,
}

impl AlertDispatcher {
    pub fn new(pager: Arc<dyn Pager>, policy: RetryPolicy) -> Self {
        Self { pager, policy }
    }

    /// Deliver one page, retrying transient failures up to the attempt limit
    pub async fn dispatch(&self, request: &PageRequest) -> Result<(), AlertDeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::new(
            self.policy.initial_delay,
            self.policy.max_delay,
            max_attempts - 1,
        );
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.pager.send_page(request).await {
                Ok(()) => {
                    let elapsed = request.received_at.elapsed();
                    log::info!(
                        "Page issued for MRN {} (attempt {}, {}ms after receipt)",
                        request.mrn,
                        attempts,
                        elapsed.as_millis()
                    );
                    if elapsed > LATENCY_BUDGET {
                        log::warn!(
                            "Page for MRN {} exceeded latency budget: {}ms",
                            request.mrn,
                            elapsed.as_millis()
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Page attempt {} for MRN {} failed: {}",
                        attempts,
                        request.mrn,
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        increment_counter!(PAGE_FAILED);
                        return Err(AlertDeliveryError {
                            mrn: request.mrn,
                            attempts,
                            last_error: e,
                        });
                    }
                }
            }
        }
    }
}

/// Run pages from the channel until it closes, each on its own task.
///
/// Undeliverable pages are recorded in the store; `paged` stays set.
pub fn spawn_pager_worker(
    mut rx: mpsc::Receiver<PageRequest>,
    dispatcher: Arc<AlertDispatcher>,
    store: PatientStore,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_flight = JoinSet::new();

        while let Some(request) = rx.recv().await {
            let dispatcher = dispatcher.clone();
            let store = store.clone();
            in_flight.spawn(async move {
                if let Err(e) = dispatcher.dispatch(&request).await {
                    log::error!("{}", e);
                    if let Err(store_err) =
                        store.record_failed_alert(e.mrn, e.attempts, &e.last_error)
                    {
                        log::error!(
                            "Could not record failed page for MRN {}: {}",
                            e.mrn,
                            store_err
                        );
                    }
                }
            });

            // Reap finished pages so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        log::info!("Pager worker stopped");
    })
}
