//! Distributed scan coordination.
//!
//! A [`ScanDirector`] merges ordered cell streams from a quorum of remote
//! deputies into one de-duplicated sequence, reissuing requests on timeout
//! and pacing itself by the consumer's `body` continuation.

use core::fmt;
use std::future::Future;

use error_stack::Report;
use futures::future::BoxFuture;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, instrument, trace, warn};

use crate::config::Backoff;
use crate::gate::Gate;
use crate::traits::{Atlas, Fanout};
use crate::types::{Cell, HostId, Key, Position, Time};

mod merge;

use merge::Gather;

/// Why a scan ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// The rouse budget ran out without a quorum contributing.
    Timeout,
    /// The port closed or the consumer aborted the scan.
    Canceled,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Timeout => f.write_str("scan timed out awaiting a quorum"),
            ScanError::Canceled => f.write_str("scan was canceled"),
        }
    }
}

impl core::error::Error for ScanError {}

/// Range-query parameters sent to scan deputies.
///
/// A continuation substitutes `(key, time)` and keeps the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    pub key: Key,
    pub time: Time,
    /// Page-size hint for the deputy.
    pub window: u32,
}

impl ScanParams {
    #[must_use]
    pub fn new(key: impl Into<Key>, time: Time, window: u32) -> Self {
        Self {
            key: key.into(),
            time,
            window,
        }
    }

    /// The same query continued from `at`.
    #[must_use]
    pub fn starting_at(&self, at: &Position) -> Self {
        Self {
            key: at.key.clone(),
            time: at.time,
            window: self.window,
        }
    }
}

/// One deputy reply: a page of ordered cells, a continuation if more remain
/// beyond it, and the originating peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPage {
    pub cells: Vec<Cell>,
    pub next: Option<Position>,
    pub from: HostId,
}

/// Coordinates one merged, ordered, de-duplicated scan across the atlas's
/// peer set.
pub struct ScanDirector<T, F> {
    params: ScanParams,
    atlas: T,
    fanout: F,
    /// Ephemeral port multiplexing deputy replies for this scan.
    port: mpsc::UnboundedReceiver<ScanPage>,
    backoff: Backoff,
}

impl<T, F> ScanDirector<T, F>
where
    T: Atlas,
    F: Fanout,
{
    #[must_use]
    pub fn new(
        params: ScanParams,
        atlas: T,
        fanout: F,
        port: mpsc::UnboundedReceiver<ScanPage>,
        backoff: Backoff,
    ) -> Self {
        Self {
            params,
            atlas,
            fanout,
            port,
            backoff,
        }
    }

    /// Run the scan, handing each batch of cells to `body`.
    ///
    /// A new batch is not produced until `body` resolves the previous one;
    /// deputy replies queue on the port meanwhile. Completes once a quorum of
    /// deputies has fully drained.
    ///
    /// # Errors
    ///
    /// [`ScanError::Timeout`] when the rouse schedule is exhausted without
    /// progress; [`ScanError::Canceled`] if the port closes. A failure from
    /// `body` aborts the scan and propagates.
    #[instrument(skip_all, name = "scan", fields(key = ?self.params.key, time = self.params.time))]
    pub async fn run<B, Fut>(mut self, mut body: B) -> Result<(), Report<ScanError>>
    where
        B: FnMut(Vec<Cell>) -> Fut,
        Fut: Future<Output = Result<(), Report<ScanError>>>,
    {
        let mut rng = StdRng::from_os_rng();
        let mut gather = Gather::new(self.atlas.clone(), self.params.clone());
        let mut attempts = 0u32;
        let mut mark = gather.last().clone();
        let mut rouse: Gate<BoxFuture<'static, ()>> = Gate::idle();

        debug!("scan started");
        for peer in self.atlas.peers() {
            self.fanout
                .scan(peer, self.params.starting_at(gather.last()));
        }
        rouse.arm(Box::pin(sleep(self.backoff.duration(0, &mut rng))));

        loop {
            tokio::select! {
                page = self.port.recv() => {
                    let Some(page) = page else {
                        debug!("port closed");
                        return Err(Report::new(ScanError::Canceled));
                    };
                    gather.admit(page, &self.fanout);

                    // Give: hand merged batches to the consumer one at a
                    // time until the merge runs dry.
                    let mut took = false;
                    loop {
                        let cells = gather.merge(&self.fanout);
                        if cells.is_empty() {
                            break;
                        }
                        took = true;
                        trace!(count = cells.len(), "delivering batch");
                        body(cells).await?;
                    }
                    if gather.finished() {
                        debug!("scan complete");
                        return Ok(());
                    }
                    if took {
                        attempts = 0;
                        mark = gather.last().clone();
                        rouse.arm(Box::pin(sleep(self.backoff.duration(0, &mut rng))));
                    }
                }
                () = &mut rouse, if rouse.is_armed() => {
                    if gather.last() != &mark {
                        // The high-water mark advanced since scheduling;
                        // no need to prod anyone yet.
                        attempts = 0;
                        mark = gather.last().clone();
                    } else if attempts >= self.backoff.retries {
                        warn!("rouse budget exhausted");
                        return Err(Report::new(ScanError::Timeout));
                    } else {
                        attempts += 1;
                        for peer in self.atlas.awaiting(gather.have()) {
                            trace!(%peer, "rousing");
                            self.fanout
                                .scan(peer, self.params.starting_at(gather.last()));
                        }
                    }
                    rouse.arm(Box::pin(sleep(self.backoff.duration(attempts, &mut rng))));
                }
            }
        }
    }
}
