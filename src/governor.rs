//! Admission control: bound concurrent backend invocations.
//!
//! Backends are resource-hungry in different ways — a GPU-resident layout
//! model tolerates one or two concurrent calls before exhausting VRAM, a
//! remote VLM server has its own concurrency ceiling, LibreOffice forks a
//! whole process per conversion. The governor enforces a **two-level
//! bound**: a global cap on total in-flight backend calls (protects host
//! memory/CPU) and a per-engine-class cap (protects the specific scarce
//! resource).
//!
//! ## Why semaphores, not a queue?
//!
//! `tokio::sync::Semaphore` queues waiters in FIFO arrival order, which
//! gives per-class fairness for free: no request starves while capacity
//! exists. Permits are `OwnedSemaphorePermit`s held inside an
//! [`AdmissionTicket`], so release-on-every-exit-path (success, failure,
//! timeout, cancellation, panic) is just `Drop`.

use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// The scarce resource an engine consumes while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineClass {
    /// GPU-resident model (layout analysis, OCR).
    GpuModel,
    /// Remote vision-language-model inference server.
    RemoteVlm,
    /// Forked tool process (LibreOffice, pandoc).
    Subprocess,
    /// Plain network fetch.
    Network,
}

impl EngineClass {
    pub const ALL: [EngineClass; 4] = [
        EngineClass::GpuModel,
        EngineClass::RemoteVlm,
        EngineClass::Subprocess,
        EngineClass::Network,
    ];
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GpuModel => "gpu_model",
            Self::RemoteVlm => "remote_vlm",
            Self::Subprocess => "subprocess",
            Self::Network => "network",
        };
        f.write_str(s)
    }
}

/// Concurrency caps consumed by [`ConcurrencyGovernor::new`].
#[derive(Debug, Clone)]
pub struct GovernorLimits {
    /// Cap on total concurrent backend calls across all classes.
    pub global: usize,
    /// Per-class caps; classes absent from the map fall back to `global`.
    pub per_class: HashMap<EngineClass, usize>,
}

/// Why an admission attempt did not produce a ticket.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmitError {
    /// No slot freed up within the admission timeout.
    Timeout { waited_ms: u64 },
    /// The request was cancelled while waiting.
    Cancelled,
}

/// A held concurrency slot: one global permit plus one class permit.
///
/// Scoped strictly to the duration of one backend call. Dropping the ticket
/// releases both permits, so every exit path releases.
#[derive(Debug)]
pub struct AdmissionTicket {
    _class: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    class: EngineClass,
}

impl AdmissionTicket {
    pub fn class(&self) -> EngineClass {
        self.class
    }
}

/// Bounds in-flight backend invocations globally and per engine class.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    global: Arc<Semaphore>,
    classes: HashMap<EngineClass, Arc<Semaphore>>,
    limits: GovernorLimits,
}

impl ConcurrencyGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        let global_cap = limits.global.max(1);
        let classes = EngineClass::ALL
            .iter()
            .map(|class| {
                let cap = limits
                    .per_class
                    .get(class)
                    .copied()
                    .unwrap_or(global_cap)
                    .max(1);
                (*class, Arc::new(Semaphore::new(cap)))
            })
            .collect();
        Self {
            global: Arc::new(Semaphore::new(global_cap)),
            classes,
            limits,
        }
    }

    /// Wait for a slot for `class`, up to `timeout`.
    ///
    /// The class permit is acquired before the global permit: a request
    /// queued on a saturated scarce engine must not pin down global
    /// capacity other classes could use. If the wait times out or is
    /// cancelled after the class permit was taken, dropping the partial
    /// future releases it.
    pub async fn admit(
        &self,
        class: EngineClass,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AdmissionTicket, AdmitError> {
        let started = Instant::now();
        let class_sem = Arc::clone(
            self.classes
                .get(&class)
                .unwrap_or_else(|| unreachable!("all classes registered in new()")),
        );
        let global_sem = Arc::clone(&self.global);

        let acquire = async move {
            // acquire_owned only errors when the semaphore is closed, which
            // never happens: the governor owns them for its whole lifetime.
            let class_permit = class_sem
                .acquire_owned()
                .await
                .unwrap_or_else(|_| unreachable!("governor semaphores are never closed"));
            let global_permit = global_sem
                .acquire_owned()
                .await
                .unwrap_or_else(|_| unreachable!("governor semaphores are never closed"));
            AdmissionTicket {
                _class: class_permit,
                _global: global_permit,
                class,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AdmitError::Cancelled),
            admitted = tokio::time::timeout(timeout, acquire) => match admitted {
                Ok(ticket) => {
                    debug!(%class, waited_ms = started.elapsed().as_millis() as u64, "admitted");
                    Ok(ticket)
                }
                Err(_) => Err(AdmitError::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                }),
            },
        }
    }

    /// Currently free slots for a class (min of class and global headroom).
    /// Snapshot only; intended for health reporting and tests.
    pub fn available(&self, class: EngineClass) -> usize {
        let class_free = self
            .classes
            .get(&class)
            .map(|s| s.available_permits())
            .unwrap_or(0);
        class_free.min(self.global.available_permits())
    }

    pub fn limits(&self) -> &GovernorLimits {
        &self.limits
    }
}
