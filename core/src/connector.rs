//! Producer-facing façade over the batch set and the committer.
//!
//! Inserts only buffer. `commit` swaps the whole batch set for a fresh one
//! under the set's mutex, then hands the retired set to the committer; it
//! blocks only while the committer's queue is full. `stop` drains the
//! committer and closes the sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::batch::{BatchSet, PreparedSet};
use crate::committer::{CommitterHandle, CommitterState, DrainReport, FailureHook};
use crate::encode;
use crate::errors::{EngineError, Result, ValidationError};
use crate::events::{
    ClickEvent, CustomEvent, ErrorEvent, Event, GraphQl, IngestMessage, InputEvent, IssueEvent,
    NetworkRequest, PageEvent, PerformanceTrackAggr, ResourceEvent, Session,
};
use crate::schema::{SchemaRegistry, destination};
use crate::sink::Sink;
use crate::telemetry::{CommitMetrics, MetricsSnapshot};
use crate::value::Row;

pub struct ConnectorBuilder {
    registry: Arc<SchemaRegistry>,
    sink: Arc<dyn Sink>,
    save_request_payloads: bool,
    hook: Option<Arc<dyn FailureHook>>,
    metrics: Option<Arc<CommitMetrics>>,
}

impl ConnectorBuilder {
    pub fn save_request_payloads(mut self, save: bool) -> Self {
        self.save_request_payloads = save;
        self
    }

    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn metrics(mut self, metrics: Arc<CommitMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the committer; must run inside a tokio runtime.
    /// The connector accepts no rows until [`Connector::prepare`] succeeds.
    pub fn build(self) -> Connector {
        let metrics = self.metrics.unwrap_or_default();
        let committer = CommitterHandle::spawn(Arc::clone(&self.sink), Arc::clone(&metrics), self.hook);
        Connector {
            registry: self.registry,
            sink: self.sink,
            current: Mutex::new(BatchSet::empty()),
            committer: tokio::sync::Mutex::new(Some(committer)),
            stopped: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            save_request_payloads: self.save_request_payloads,
            metrics,
        }
    }
}

pub struct Connector {
    registry: Arc<SchemaRegistry>,
    sink: Arc<dyn Sink>,
    current: Mutex<BatchSet>,
    /// Serialises commit against stop; `None` once stopped.
    committer: tokio::sync::Mutex<Option<CommitterHandle>>,
    stopped: AtomicBool,
    next_task_id: AtomicU64,
    save_request_payloads: bool,
    metrics: Arc<CommitMetrics>,
}

impl Connector {
    pub fn builder(registry: Arc<SchemaRegistry>, sink: Arc<dyn Sink>) -> ConnectorBuilder {
        ConnectorBuilder {
            registry,
            sink,
            save_request_payloads: false,
            hook: None,
            metrics: None,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Rows currently buffered for `destination` in the open batch set.
    pub fn pending_rows(&self, destination: &str) -> usize {
        self.current_set().rows(destination)
    }

    pub fn pending_total(&self) -> usize {
        self.current_set().total_rows()
    }

    pub async fn committer_state(&self) -> CommitterState {
        match self.committer.lock().await.as_ref() {
            Some(handle) => handle.state(),
            None => CommitterState::Stopped,
        }
    }

    fn current_set(&self) -> MutexGuard<'_, BatchSet> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    async fn fresh_set(&self) -> BatchSet {
        let PreparedSet { set, failures } = BatchSet::prepare(&self.registry, self.sink.as_ref()).await;
        if !failures.is_empty() {
            CommitMetrics::add(&self.metrics.prepare_failures, failures.len() as u64);
        }
        for failure in &failures {
            error!(error = %failure, "can't prepare new batch");
        }
        set
    }

    /// Installs a fresh batch for every destination, replacing the current set.
    /// Meant for startup: rows still buffered in the replaced set are dropped.
    ///
    /// Destinations whose batch could not be allocated stay unavailable until the
    /// next commit; the first such failure is returned after the set is installed.
    pub async fn prepare(&self) -> Result<()> {
        self.ensure_running()?;
        let PreparedSet { set, mut failures } =
            BatchSet::prepare(&self.registry, self.sink.as_ref()).await;
        let replaced = std::mem::replace(&mut *self.current_set(), set);
        if replaced.total_rows() > 0 {
            warn!(rows = replaced.total_rows(), "prepare discarded uncommitted rows");
        }
        if failures.is_empty() {
            return Ok(());
        }
        CommitMetrics::add(&self.metrics.prepare_failures, failures.len() as u64);
        Err(failures.swap_remove(0))
    }

    /// Detaches the current batch set, installs a fresh one and queues the
    /// detached set for transmission.
    ///
    /// Waits for a free queue slot before detaching anything; producers keep
    /// appending to the open set meanwhile, and dropping a blocked commit
    /// leaves that set in place.
    pub async fn commit(&self) -> Result<()> {
        self.ensure_running()?;
        let committer = self.committer.lock().await;
        let Some(handle) = committer.as_ref() else {
            return Err(EngineError::Stopped);
        };
        let permit = handle.reserve().await?;

        let fresh = self.fresh_set().await;
        let retired = std::mem::replace(&mut *self.current_set(), fresh);

        let task = retired.into_task(self.next_task_id.fetch_add(1, Ordering::Relaxed), &self.registry);
        let (task_id, rows) = (task.id(), task.total_rows());
        permit.send(task);
        CommitMetrics::incr(&self.metrics.tasks_enqueued);
        debug!(task_id, rows, "task enqueued");
        Ok(())
    }

    /// Drains the committer and closes the sink. Inserts and commits fail
    /// with `Stopped` afterwards, as does a second call.
    pub async fn stop(&self) -> Result<DrainReport> {
        let mut committer = self.committer.lock().await;
        let Some(mut handle) = committer.take() else {
            return Err(EngineError::Stopped);
        };
        self.stopped.store(true, Ordering::SeqCst);

        let abandoned = self.current_set().total_rows();
        if abandoned > 0 {
            warn!(rows = abandoned, "stopping with uncommitted rows");
        }

        let report = handle.shutdown().await?;
        self.sink.close().await?;
        info!(
            tasks = report.tasks_sent,
            rows = report.rows_sent,
            failed_batches = report.batches_failed,
            "connector stopped"
        );
        Ok(report)
    }

    fn append(&self, destination: &str, row: Row) -> Result<()> {
        self.ensure_running()?;
        let result = self.current_set().append(destination, row);
        self.record_append(destination, result)
    }

    fn record_append(&self, destination: &str, result: Result<usize>) -> Result<()> {
        match &result {
            Ok(truncated) => {
                CommitMetrics::incr(&self.metrics.rows_appended);
                if *truncated > 0 {
                    CommitMetrics::add(&self.metrics.rows_truncated, *truncated as u64);
                    debug!(destination, cells = *truncated, "strings truncated to column budget");
                }
            }
            Err(EngineError::AlreadySent { .. }) => {
                CommitMetrics::incr(&self.metrics.already_sent_drops);
                warn!(destination, "row dropped, batch already sent");
            }
            Err(err @ EngineError::Encoding { .. }) => {
                CommitMetrics::incr(&self.metrics.encoding_rejects);
                error!(destination, error = %err, "can't append row");
            }
            Err(err) => {
                error!(destination, error = %err, "can't append row");
            }
        }
        result.map(|_| ())
    }

    fn reject<T>(&self, err: ValidationError) -> Result<T> {
        CommitMetrics::incr(&self.metrics.validation_rejects);
        Err(err.into())
    }

    fn skip(&self) -> Result<()> {
        self.ensure_running()?;
        CommitMetrics::incr(&self.metrics.rows_skipped);
        Ok(())
    }

    pub fn insert_web_session(&self, session: &Session) -> Result<()> {
        match encode::session_row(session) {
            Ok(row) => self.append(destination::SESSIONS, row),
            Err(err) => self.reject(err),
        }
    }

    pub fn insert_web_resource_event(&self, session: &Session, msg: &ResourceEvent) -> Result<()> {
        match encode::resource_row(session, msg) {
            Ok(row) => self.append(destination::RESOURCES, row),
            Err(err) => self.reject(err),
        }
    }

    pub fn insert_web_page_event(&self, session: &Session, msg: &PageEvent) -> Result<()> {
        self.append(destination::PAGES, encode::page_row(session, msg))
    }

    pub fn insert_web_click_event(&self, session: &Session, msg: &ClickEvent) -> Result<()> {
        match encode::click_row(session, msg) {
            Some(row) => self.append(destination::CLICKS, row),
            None => self.skip(),
        }
    }

    pub fn insert_web_input_event(&self, session: &Session, msg: &InputEvent) -> Result<()> {
        match encode::input_row(session, msg) {
            Some(row) => self.append(destination::INPUTS, row),
            None => self.skip(),
        }
    }

    pub fn insert_web_error_event(&self, session: &Session, msg: &ErrorEvent) -> Result<()> {
        match encode::error_row(session, msg) {
            Ok(row) => self.append(destination::ERRORS, row),
            Err(err) => self.reject(err),
        }
    }

    pub fn insert_web_performance_track_aggr(
        &self,
        session: &Session,
        msg: &PerformanceTrackAggr,
    ) -> Result<()> {
        self.append(destination::PERFORMANCE, encode::performance_row(session, msg))
    }

    pub fn insert_autocomplete(&self, session: &Session, kind: &str, value: &str) -> Result<()> {
        match encode::autocomplete_row(session, kind, value) {
            Some(row) => self.append(destination::AUTOCOMPLETES, row),
            None => self.skip(),
        }
    }

    pub fn insert_request(&self, session: &Session, msg: &NetworkRequest) -> Result<()> {
        match encode::request_row(session, msg, self.save_request_payloads) {
            Ok(row) => self.append(destination::REQUESTS, row),
            Err(err) => self.reject(err),
        }
    }

    pub fn insert_custom(&self, session: &Session, msg: &CustomEvent) -> Result<()> {
        self.append(destination::CUSTOM, encode::custom_row(session, msg))
    }

    pub fn insert_graphql(&self, session: &Session, msg: &GraphQl) -> Result<()> {
        self.append(destination::GRAPHQL, encode::graphql_row(session, msg))
    }

    /// Appends to `issuesEvents` and `issues` under one lock so both rows land
    /// in the same generation.
    pub fn insert_issue(&self, session: &Session, msg: &IssueEvent) -> Result<()> {
        let rows = match encode::issue_rows(session, msg) {
            Ok(rows) => rows,
            Err(err) => return self.reject(err),
        };
        self.ensure_running()?;
        let mut set = self.current_set();
        let result = set.append(destination::ISSUE_EVENTS, rows.event);
        self.record_append(destination::ISSUE_EVENTS, result)?;
        let result = set.append(destination::ISSUES, rows.issue);
        self.record_append(destination::ISSUES, result)
    }

    /// Routes one decoded envelope to the matching insert.
    pub fn insert_message(&self, msg: &IngestMessage) -> Result<()> {
        let session = &msg.session;
        match &msg.event {
            Event::Session => self.insert_web_session(session),
            Event::Resource(e) => self.insert_web_resource_event(session, e),
            Event::Page(e) => self.insert_web_page_event(session, e),
            Event::Click(e) => self.insert_web_click_event(session, e),
            Event::Input(e) => self.insert_web_input_event(session, e),
            Event::Error(e) => self.insert_web_error_event(session, e),
            Event::Performance(e) => self.insert_web_performance_track_aggr(session, e),
            Event::Request(e) => self.insert_request(session, e),
            Event::Custom(e) => self.insert_custom(session, e),
            Event::GraphQl(e) => self.insert_graphql(session, e),
            Event::Issue(e) => self.insert_issue(session, e),
            Event::Autocomplete { kind, value } => self.insert_autocomplete(session, kind, value),
        }
    }
}
