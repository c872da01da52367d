//! Distributed aggregation engine.
//!
//! # Parallel
//! ```text
//! fetch current page of every run concurrently (join_all)
//!     → loop until page full:
//!         KWayMerger::next_step
//!             Emit(i)   → pop head of run i (dedup if enabled)
//!             Refill(i) → fetch run i's next page (keeps global order)
//!             Done      → stop
//! ```
//!
//! # Sequential
//! Runs in rank order, one at a time, each drained (following its pages)
//! until the page reaches `page_size × fill_factor`.
//!
//! A run's cursor is the page it is serving plus the number of entries
//! already consumed from it, so a resumed scan re-fetches that page and
//! skips exactly what was consumed.
//!
//! With deduplication on, a sorted scan carries the references emitted with
//! its last sort value into the next page. Unsorted scans deduplicate within
//! a page only.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::aggregation::merge::{KWayMerger, MergeSource, MergeStep};
use crate::aggregation::token::{ContinuationToken, DedupBoundary, ServerCursor};
use crate::backend::{BackendRequest, BackendServer, CallLimits, SearchEntry, ServerOrchestrator};
use crate::error::{BrokerError, BrokerResult, ServerError};
use crate::query::SortKey;
use crate::strategy::ExecutionStrategy;

/// Everything the engine needs to run one page of one search.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub resource_type: Option<String>,
    /// Wire parameters of the (possibly rewritten) query.
    pub params: Vec<(String, String)>,
    pub sort: Vec<SortKey>,
    pub page_size: usize,
    /// Count requested from each server.
    pub server_page_size: usize,
    pub limits: CallLimits,
    pub deduplicate: bool,
    /// Carried from the previous page of a deduplicated sorted scan.
    pub dedup_boundary: Option<DedupBoundary>,
    pub fill_factor: f64,
    pub cancel: CancellationToken,
}

/// One merged page.
#[derive(Debug, Clone)]
pub struct AggregatedPage {
    pub entries: Vec<SearchEntry>,
    /// Entries backends attached through passthrough includes.
    pub included: Vec<SearchEntry>,
    pub continuation: Option<ContinuationToken>,
    pub total: Option<u64>,
    pub degraded: Vec<ServerError>,
}

struct Run {
    server: Arc<BackendServer>,
    buffer: VecDeque<SearchEntry>,
    page_token: Option<String>,
    page_offset: usize,
    next_token: Option<String>,
    fetched: bool,
    failed: bool,
    results_returned: u64,
    last_sort_value: Option<Vec<Value>>,
    total: Option<u64>,
    /// Last value emitted on a previous page; checked once after re-fetch.
    resume_floor: Option<Vec<Value>>,
}

impl Run {
    fn new(server: Arc<BackendServer>, cursor: ServerCursor) -> Self {
        let resuming = cursor.page_token.is_some() || cursor.page_offset > 0;
        Self {
            server,
            buffer: VecDeque::new(),
            page_token: cursor.page_token,
            page_offset: cursor.page_offset,
            next_token: cursor.token,
            fetched: false,
            failed: false,
            results_returned: cursor.results_returned,
            resume_floor: if resuming { cursor.last_sort_value.clone() } else { None },
            last_sort_value: cursor.last_sort_value,
            total: None,
        }
    }

    fn advance(&mut self) {
        self.page_token = self.next_token.take();
        self.page_offset = 0;
    }

    /// A failed run keeps the position it failed at so the next page
    /// retries it.
    fn cursor(&self) -> ServerCursor {
        let drained = self.fetched && self.buffer.is_empty();
        let (page_token, page_offset, exhausted) = if self.failed {
            (self.page_token.clone(), self.page_offset, false)
        } else if drained {
            match &self.next_token {
                Some(next) => (Some(next.clone()), 0, false),
                None => (None, 0, true),
            }
        } else {
            (self.page_token.clone(), self.page_offset, false)
        };

        ServerCursor {
            endpoint: self.server.id.clone(),
            token: match (exhausted, self.failed) {
                (true, _) => None,
                (false, true) => self.page_token.clone(),
                (false, false) => self.next_token.clone(),
            },
            exhausted,
            last_sort_value: self.last_sort_value.clone(),
            results_returned: self.results_returned,
            page_token,
            page_offset,
        }
    }
}

impl MergeSource for Run {
    fn head(&self) -> Option<&SearchEntry> {
        self.buffer.front()
    }

    fn needs_refill(&self) -> bool {
        self.fetched && !self.failed && self.buffer.is_empty() && self.next_token.is_some()
    }
}

/// Output being assembled for one page.
struct PageBuilder {
    entries: Vec<SearchEntry>,
    included: Vec<SearchEntry>,
    seen: HashSet<String>,
    seen_included: HashSet<String>,
    degraded: Vec<ServerError>,
    deduplicate: bool,
    /// References emitted with the latest sort value, including those
    /// carried from the previous page while the tie continues.
    boundary: Option<DedupBoundary>,
}

impl PageBuilder {
    fn new(deduplicate: bool, carried: Option<DedupBoundary>) -> Self {
        let boundary = carried.filter(|_| deduplicate);
        let seen = boundary
            .iter()
            .flat_map(|b| b.references.iter().cloned())
            .collect();
        Self {
            entries: Vec::new(),
            included: Vec::new(),
            seen,
            seen_included: HashSet::new(),
            degraded: Vec::new(),
            deduplicate,
            boundary,
        }
    }

    /// Consume the head of `run`, emitting it unless it is a duplicate.
    fn take_head(&mut self, run: &mut Run) {
        let Some(entry) = run.buffer.pop_front() else { return };
        run.page_offset += 1;

        if self.deduplicate {
            let reference = entry.reference();
            if !self.seen.insert(reference.clone()) {
                tracing::trace!(server = %run.server.id, id = %entry.id, "Duplicate entry skipped");
                return;
            }
            match self.boundary.as_mut().filter(|b| b.sort_values == entry.sort_values) {
                Some(b) => b.references.push(reference),
                None => {
                    self.boundary = Some(DedupBoundary {
                        sort_values: entry.sort_values.clone(),
                        references: vec![reference],
                    })
                }
            }
        }
        run.results_returned += 1;
        run.last_sort_value = Some(entry.sort_values.clone());
        self.entries.push(entry);
    }

    fn add_included(&mut self, included: Vec<SearchEntry>) {
        for entry in included {
            if self.seen_included.insert(entry.reference()) {
                self.included.push(entry);
            }
        }
    }
}

pub struct AggregationEngine {
    orchestrator: Arc<ServerOrchestrator>,
}

impl AggregationEngine {
    pub fn new(orchestrator: Arc<ServerOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Produce one page.
    ///
    /// `runs` are the servers to consult, in rank order, each with its
    /// resume cursor (`ServerCursor::fresh` on a first page). `carried`
    /// cursors take no part in this page and are copied into the next token.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        strategy: ExecutionStrategy,
        runs: Vec<(Arc<BackendServer>, ServerCursor)>,
        carried: Vec<ServerCursor>,
    ) -> BrokerResult<AggregatedPage> {
        let merger = KWayMerger::new(&ctx.sort);
        let mut runs: Vec<Run> = runs
            .into_iter()
            .map(|(server, cursor)| Run::new(server, cursor))
            .collect();
        let mut page = PageBuilder::new(ctx.deduplicate, ctx.dedup_boundary.clone());

        match strategy {
            ExecutionStrategy::Parallel => self.run_parallel(ctx, &merger, &mut runs, &mut page).await?,
            ExecutionStrategy::Sequential => self.run_sequential(ctx, &merger, &mut runs, &mut page).await?,
        }

        if ctx.cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        // A run that served any page contributed, even if a later refill failed.
        let attempted = runs.iter().filter(|r| r.fetched || r.failed).count();
        let contributed = runs.iter().filter(|r| r.fetched).count();
        if attempted > 0 && contributed == 0 {
            return Err(BrokerError::AllServersFailed {
                failures: page.degraded,
            });
        }

        let total = if page.degraded.is_empty() {
            runs.iter()
                .filter(|r| r.fetched)
                .map(|r| r.total)
                .sum::<Option<u64>>()
        } else {
            None
        };

        let mut cursors = carried;
        cursors.extend(runs.iter().map(Run::cursor));
        let continuation = if cursors.is_empty() || cursors.iter().all(|c| c.exhausted) {
            None
        } else {
            Some(ContinuationToken {
                servers: cursors,
                sort_criteria: ctx.sort.clone(),
                page_size: ctx.page_size,
                execution_strategy: strategy,
                resource_type: ctx.resource_type.clone(),
                server_page_size: ctx.server_page_size,
                dedup_boundary: if ctx.sort.is_empty() { None } else { page.boundary.take() },
            })
        };

        tracing::debug!(
            strategy = strategy.as_str(),
            entries = page.entries.len(),
            degraded = page.degraded.len(),
            has_more = continuation.is_some(),
            "Page aggregated"
        );

        Ok(AggregatedPage {
            entries: page.entries,
            included: page.included,
            continuation,
            total,
            degraded: page.degraded,
        })
    }

    async fn run_parallel(
        &self,
        ctx: &ExecutionContext,
        merger: &KWayMerger,
        runs: &mut [Run],
        page: &mut PageBuilder,
    ) -> BrokerResult<()> {
        let results = join_all(runs.iter_mut().map(|run| self.fetch(ctx, merger, run))).await;
        for result in results {
            match result {
                Ok(included) => page.add_included(included),
                Err(e) => page.degraded.push(e),
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        while page.entries.len() < ctx.page_size {
            match merger.next_step(runs) {
                MergeStep::Emit(idx) => page.take_head(&mut runs[idx]),
                MergeStep::Refill(idx) => {
                    let run = &mut runs[idx];
                    run.advance();
                    match self.fetch(ctx, merger, run).await {
                        Ok(included) => page.add_included(included),
                        Err(ServerError::Cancelled { .. }) => return Err(BrokerError::Cancelled),
                        Err(e) => page.degraded.push(e),
                    }
                }
                MergeStep::Done => break,
            }
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        ctx: &ExecutionContext,
        merger: &KWayMerger,
        runs: &mut [Run],
        page: &mut PageBuilder,
    ) -> BrokerResult<()> {
        let target = ((ctx.page_size as f64 * ctx.fill_factor).ceil() as usize).clamp(1, ctx.page_size.max(1));

        for run in runs.iter_mut() {
            if page.entries.len() >= target {
                break;
            }
            match self.fetch(ctx, merger, run).await {
                Ok(included) => page.add_included(included),
                Err(ServerError::Cancelled { .. }) => return Err(BrokerError::Cancelled),
                Err(e) => {
                    page.degraded.push(e);
                    continue;
                }
            }

            loop {
                while page.entries.len() < ctx.page_size && run.head().is_some() {
                    page.take_head(run);
                }
                if page.entries.len() >= target || !run.needs_refill() {
                    break;
                }
                run.advance();
                match self.fetch(ctx, merger, run).await {
                    Ok(included) => page.add_included(included),
                    Err(ServerError::Cancelled { .. }) => return Err(BrokerError::Cancelled),
                    Err(e) => {
                        page.degraded.push(e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch the run's current page, skipping entries already consumed.
    async fn fetch(
        &self,
        ctx: &ExecutionContext,
        merger: &KWayMerger,
        run: &mut Run,
    ) -> Result<Vec<SearchEntry>, ServerError> {
        let request = BackendRequest {
            resource_type: ctx.resource_type.clone(),
            params: ctx.params.clone(),
            count: ctx.server_page_size,
            page_token: run.page_token.clone(),
        };

        let result = match self
            .orchestrator
            .search(&run.server, &request, &ctx.sort, &ctx.limits, &ctx.cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                run.failed = true;
                run.buffer.clear();
                return Err(e);
            }
        };

        let skip = run.page_offset.min(result.entries.len());
        if skip < run.page_offset {
            tracing::warn!(
                server = %run.server.id,
                expected = run.page_offset,
                available = result.entries.len(),
                "Backend page shrank since it was last read"
            );
        }
        run.buffer = result.entries.into_iter().skip(skip).collect();
        run.page_offset = skip;
        run.next_token = result.next_token;
        if !run.fetched {
            run.total = result.total;
        }
        run.fetched = true;

        if let (Some(floor), Some(head)) = (run.resume_floor.take(), run.buffer.front()) {
            if !ctx.sort.is_empty()
                && merger.compare_sort_values(&head.sort_values, &floor) == std::cmp::Ordering::Less
            {
                tracing::warn!(
                    server = %run.server.id,
                    "Backend ordering changed since the previous page"
                );
            }
        }

        Ok(result.included)
    }
}
