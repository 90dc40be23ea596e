//! Dispatch engine: turns rows into deliveries, one row at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use super::log::{LogRecord, LogWriter, RowOutcome};
use super::observer::{CapDecision, DispatchObserver, TracingObserver};
use crate::config::{ChannelKind, DispatchConfig};
use crate::error::{Result, TransportError};
use crate::recipient;
use crate::source::{Row, RowCount, RowSource, Rows, SourceOptions};
use crate::store::{HistoryGate, SendRecord, SendStatus};
use crate::template::{Template, TemplateRenderer};
use crate::transport::{Delivery, SendAttempt, SendRequest, Transport};

/// Body template plus the optional subject template (email).
#[derive(Debug, Clone)]
pub struct Templates {
    pub body: Template,
    pub subject: Option<Template>,
}

impl Templates {
    pub fn body(body: Template) -> Self {
        Self {
            body,
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: Template) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Rows to dispatch, already positioned at the start row.
pub struct RunInput {
    /// Input headers, in file order; become the leading log columns.
    pub headers: Vec<String>,
    pub rows: Rows,
    pub total: RowCount,
    pub templates: Templates,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every row was processed.
    Exhausted,
    LimitReached,
    Cancelled,
    /// The daily cap was reached and the observer chose to stop.
    CapDeclined,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exhausted => "exhausted",
            Self::LimitReached => "limit_reached",
            Self::Cancelled => "cancelled",
            Self::CapDeclined => "cap_declined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total: RowCount,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Duplicates and rows without a recipient.
    pub skipped: usize,
    pub dry_run: usize,
    pub stop: StopReason,
    pub output: PathBuf,
}

/// Mutable per-run bookkeeping.
struct RunState {
    processed: usize,
    sent: usize,
    failed: usize,
    skipped: usize,
    dry_run: usize,
    /// Successful sends for the account today, including this run.
    sent_today: u64,
    cap_answered: bool,
    batch: Vec<SendRecord>,
}

/// What happened to one row.
struct RowResult {
    log: LogRecord,
    history: Option<SendRecord>,
    notice: Option<String>,
    pace: bool,
}

/// Sequential bulk sender over a single transport session.
pub struct Dispatcher<T: Transport> {
    config: DispatchConfig,
    transport: T,
    history: Arc<dyn HistoryGate>,
    renderer: Box<dyn TemplateRenderer>,
    observer: Arc<dyn DispatchObserver>,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        config: DispatchConfig,
        transport: T,
        history: Arc<dyn HistoryGate>,
        renderer: Box<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            config,
            transport,
            history,
            renderer,
            observer: Arc::new(TracingObserver::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Flag checked once per row; set it to stop the run after the
    /// current row.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Open `path`, count it, and dispatch from the configured start row.
    ///
    /// Any failure to open the file or create the output log happens before
    /// the first row is touched.
    pub async fn run_file(self, path: &Path, templates: Templates) -> Result<RunSummary> {
        self.config.validate()?;
        let source = RowSource::open(path, SourceOptions::for_channel(self.config.channel))?;
        let total = RowSource::count(path);
        let headers = source.headers().to_vec();
        let rows = source.rows_from(self.config.start_row);

        self.run(RunInput {
            headers,
            rows,
            total,
            templates,
        })
        .await
    }

    /// Dispatch every row of `input`. Consumes the dispatcher; the transport
    /// is closed when the run ends.
    pub async fn run(self, input: RunInput) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "dispatch",
            %run_id,
            account = %self.config.account.name
        );
        self.execute(run_id, input).instrument(span).await
    }

    async fn execute(mut self, run_id: Uuid, input: RunInput) -> Result<RunSummary> {
        self.config.validate()?;
        let RunInput {
            headers,
            rows,
            total,
            templates,
        } = input;

        let mut log = LogWriter::create(&self.config.output, &headers, templates.subject.is_some())?;

        info!(
            channel = %self.config.channel,
            transport = self.transport.name(),
            %total,
            start_row = self.config.start_row,
            dry_run = self.config.dry_run,
            output = %self.config.output.display(),
            "Dispatch run starting"
        );
        self.observer.on_start(total);

        let sent_today = match self.history.daily_count(self.config.account.id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Daily count unavailable, assuming 0");
                0
            }
        };
        let mut state = RunState {
            processed: 0,
            sent: 0,
            failed: 0,
            skipped: 0,
            dry_run: 0,
            sent_today,
            cap_answered: false,
            batch: Vec::with_capacity(self.config.batch_size.max(1)),
        };

        let outcome = self.drive(rows, &templates, &mut log, &mut state).await;

        self.flush_batch(&mut state.batch).await;
        let log_flushed = log.flush();
        self.transport.close().await;

        let stop = outcome?;
        log_flushed?;

        let summary = RunSummary {
            run_id,
            total,
            processed: state.processed,
            sent: state.sent,
            failed: state.failed,
            skipped: state.skipped,
            dry_run: state.dry_run,
            stop,
            output: self.config.output.clone(),
        };
        info!(
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            %stop,
            "Dispatch run finished"
        );
        self.observer.on_complete(&summary);
        Ok(summary)
    }

    async fn drive(
        &mut self,
        mut rows: Rows,
        templates: &Templates,
        log: &mut LogWriter<std::fs::File>,
        state: &mut RunState,
    ) -> Result<StopReason> {
        let limit = self.config.row_limit();

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                info!(processed = state.processed, "Cancellation requested");
                return Ok(StopReason::Cancelled);
            }
            if limit.is_some_and(|l| state.processed >= l) {
                return Ok(StopReason::LimitReached);
            }

            let row = match rows.next() {
                None => return Ok(StopReason::Exhausted),
                Some(Ok(row)) => row,
                Some(Err(e)) => {
                    warn!(error = %e, processed = state.processed, "Row source failed mid-run");
                    return Err(e.into());
                }
            };

            if self.cap_declined(state).await {
                return Ok(StopReason::CapDeclined);
            }

            let row_number = self.config.start_row + state.processed;
            let result = self.process_row(row_number, row, templates).await;

            log.write(&result.log)?;
            state.processed += 1;
            match result.log.outcome {
                RowOutcome::Sent => {
                    state.sent += 1;
                    state.sent_today += 1;
                }
                RowOutcome::Failed => state.failed += 1,
                RowOutcome::DryRun => state.dry_run += 1,
                RowOutcome::Duplicate | RowOutcome::NoRecipient => state.skipped += 1,
            }

            if let Some(record) = result.history {
                state.batch.push(record);
                if state.batch.len() >= self.config.batch_size.max(1) {
                    self.flush_batch(&mut state.batch).await;
                }
            }

            if let Some(notice) = result.notice {
                self.observer.on_progress(&notice, state.processed);
            }
            if self.config.progress_every > 0 && state.processed % self.config.progress_every == 0 {
                let message = format!(
                    "Processed {} rows: {} sent, {} failed, {} skipped",
                    state.processed, state.sent, state.failed, state.skipped
                );
                self.observer.on_progress(&message, state.processed);
            }

            if result.pace && !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
        }
    }

    /// Ask the observer once per run when the daily cap is reached.
    async fn cap_declined(&self, state: &mut RunState) -> bool {
        let cap = self.config.daily_cap;
        if cap == 0 || state.cap_answered || state.sent_today < cap {
            return false;
        }
        state.cap_answered = true;
        let decision = self.observer.on_daily_cap(state.sent_today, cap).await;
        info!(sent_today = state.sent_today, cap, ?decision, "Daily cap reached");
        decision == CapDecision::Stop
    }

    async fn process_row(&mut self, row_number: usize, row: Row, templates: &Templates) -> RowResult {
        let field = self.config.recipient_field.as_str();
        let raw = row.get(field).or_else(|| row.get_ignore_case(field));
        let recipient = match self.config.channel {
            ChannelKind::Sms => recipient::normalize(
                raw,
                self.config.recipient_prefix.as_deref(),
                self.config.force_plus,
            ),
            ChannelKind::Email => raw.map(str::trim).unwrap_or_default().to_string(),
        };

        let skipped = |outcome: RowOutcome, response: &str, row: Row, recipient: String| {
            let notice = format!("Row {row_number}: skipped ({response})");
            RowResult {
                log: LogRecord {
                    row,
                    recipient,
                    subject: None,
                    message: String::new(),
                    attempts: 0,
                    success: false,
                    status_code: None,
                    response: response.to_string(),
                    sent_at: Utc::now(),
                    outcome,
                },
                history: None,
                notice: Some(notice),
                pace: false,
            }
        };

        if recipient.is_empty() {
            debug!(row = row_number, field, "No recipient");
            return skipped(RowOutcome::NoRecipient, "no recipient", row, recipient);
        }

        if self.config.skip_duplicates {
            let seen = match self.history.was_sent_today(&recipient).await {
                Ok(seen) => seen,
                Err(e) => {
                    warn!(error = %e, "Duplicate check unavailable, assuming not sent");
                    false
                }
            };
            if seen {
                debug!(row = row_number, %recipient, "Already sent today");
                return skipped(RowOutcome::Duplicate, "already sent today", row, recipient);
            }
        }

        let message = templates.body.render(&*self.renderer, &row);
        let subject = templates
            .subject
            .as_ref()
            .map(|t| t.render(&*self.renderer, &row));

        if self.config.dry_run {
            let notice = format!("Row {row_number}: dry run to {recipient}");
            return RowResult {
                log: LogRecord {
                    row,
                    recipient,
                    subject,
                    message,
                    attempts: 0,
                    success: true,
                    status_code: None,
                    response: "dry run".into(),
                    sent_at: Utc::now(),
                    outcome: RowOutcome::DryRun,
                },
                history: None,
                notice: Some(notice),
                pace: true,
            };
        }

        let last = self
            .deliver(&recipient, subject.as_deref(), &message)
            .await;
        let sent_at = Utc::now();
        let outcome = if last.ok {
            RowOutcome::Sent
        } else {
            warn!(
                row = row_number,
                %recipient,
                attempts = last.index,
                status = ?last.status_code,
                "Delivery failed"
            );
            RowOutcome::Failed
        };

        RowResult {
            history: Some(SendRecord {
                account_id: self.config.account.id,
                recipient: recipient.clone(),
                message: message.clone(),
                status: SendStatus::from_ok(last.ok),
                sent_at,
            }),
            log: LogRecord {
                row,
                recipient,
                subject,
                message,
                attempts: last.index,
                success: last.ok,
                status_code: last.status_code,
                response: last.response,
                sent_at,
                outcome,
            },
            notice: None,
            pace: true,
        }
    }

    /// Up to `retries + 1` attempts with backoff and a session reset between
    /// them. Returns the last attempt.
    async fn deliver(&mut self, recipient: &str, subject: Option<&str>, body: &str) -> SendAttempt {
        let max_attempts = self.config.max_attempts();
        let timeout = self.config.timeout;
        let mut last = SendAttempt::from_delivery(0, Delivery::failed(""));

        for index in 1..=max_attempts {
            let request = SendRequest {
                recipient,
                subject,
                body,
                credential: &self.config.credential,
            };

            let result = tokio::time::timeout(timeout, self.transport.send(&request, timeout)).await;
            let delivery = match result {
                Ok(Ok(delivery)) => delivery,
                Ok(Err(e)) => Delivery::failed(e.to_string()),
                Err(_) => Delivery::failed(
                    TransportError::Timeout {
                        name: self.transport.name().to_string(),
                        timeout,
                    }
                    .to_string(),
                ),
            };
            last = SendAttempt::from_delivery(index, delivery);

            if last.ok {
                debug!(%recipient, attempt = index, status = ?last.status_code, "Delivered");
                break;
            }
            debug!(
                %recipient,
                attempt = index,
                status = ?last.status_code,
                response = %last.response,
                "Attempt failed"
            );

            if index < max_attempts {
                tokio::time::sleep(self.config.backoff.delay(index)).await;
                if let Err(e) = self.transport.reset().await {
                    warn!(error = %e, "Transport reset failed");
                    last.response = format!("{} (reset failed: {e})", last.response);
                }
            }
        }

        last
    }

    /// Write pending history. Failures are logged and the batch is dropped.
    async fn flush_batch(&self, batch: &mut Vec<SendRecord>) {
        if batch.is_empty() {
            return;
        }
        match self.history.record_batch(batch).await {
            Ok(()) => info!(count = batch.len(), "History batch flushed"),
            Err(e) => warn!(error = %e, count = batch.len(), "History batch dropped"),
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::AccountRef;
    use crate::error::{DatabaseError, Error, SourceError};
    use crate::template::Dialect;

    // ── Mocks ───────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct TransportLog {
        calls: Arc<Mutex<Vec<(String, Option<String>, String)>>>,
        resets: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        /// Raise this flag once the given number of sends has happened.
        cancel_after: Arc<Mutex<Option<(usize, Arc<AtomicBool>)>>>,
    }

    impl TransportLog {
        fn recipients(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    enum Reply {
        Status(u16),
        Error(&'static str),
        Hang,
    }

    struct MockTransport {
        log: TransportLog,
        script: VecDeque<Reply>,
        fallback: u16,
    }

    impl MockTransport {
        fn ok() -> Self {
            Self::scripted(Vec::new(), 200)
        }

        fn scripted(script: Vec<Reply>, fallback: u16) -> Self {
            Self {
                log: TransportLog::default(),
                script: script.into(),
                fallback,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        async fn send(
            &mut self,
            request: &SendRequest<'_>,
            _timeout: Duration,
        ) -> std::result::Result<Delivery, TransportError> {
            self.log.calls.lock().unwrap().push((
                request.recipient.to_string(),
                request.subject.map(str::to_string),
                request.body.to_string(),
            ));
            if let Some((after, flag)) = self.log.cancel_after.lock().unwrap().as_ref()
                && self.log.count() >= *after
            {
                flag.store(true, Ordering::SeqCst);
            }

            match self.script.pop_front().unwrap_or(Reply::Status(self.fallback)) {
                Reply::Status(code) => Ok(Delivery {
                    ok: (200..300).contains(&code),
                    status_code: Some(code),
                    response: format!("status {code}"),
                }),
                Reply::Error(reason) => Err(TransportError::SendFailed {
                    name: "mock".into(),
                    reason: reason.into(),
                }),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Delivery::failed("unreachable"))
                }
            }
        }

        async fn reset(&mut self) -> std::result::Result<(), TransportError> {
            self.log.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.log.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockHistory {
        daily: u64,
        sent_today: HashSet<String>,
        fail_reads: bool,
        fail_writes: bool,
        batches: Mutex<Vec<Vec<SendRecord>>>,
    }

    impl MockHistory {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl HistoryGate for MockHistory {
        async fn daily_count(&self, _account_id: i64) -> std::result::Result<u64, DatabaseError> {
            if self.fail_reads {
                return Err(DatabaseError::Query("down".into()));
            }
            Ok(self.daily)
        }

        async fn was_sent_today(&self, recipient: &str) -> std::result::Result<bool, DatabaseError> {
            if self.fail_reads {
                return Err(DatabaseError::Query("down".into()));
            }
            Ok(self.sent_today.contains(recipient))
        }

        async fn record_batch(&self, records: &[SendRecord]) -> std::result::Result<(), DatabaseError> {
            if self.fail_writes {
                return Err(DatabaseError::Query("disk full".into()));
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        cap_answer: Option<CapDecision>,
        cap_asked: AtomicUsize,
        progress: Mutex<Vec<(String, usize)>>,
        completed: Mutex<Option<RunSummary>>,
    }

    #[async_trait]
    impl DispatchObserver for RecordingObserver {
        fn on_progress(&self, message: &str, processed: usize) {
            self.progress.lock().unwrap().push((message.to_string(), processed));
        }

        async fn on_daily_cap(&self, _sent_today: u64, _cap: u64) -> CapDecision {
            self.cap_asked.fetch_add(1, Ordering::SeqCst);
            self.cap_answer.unwrap_or(CapDecision::Stop)
        }

        fn on_complete(&self, summary: &RunSummary) {
            *self.completed.lock().unwrap() = Some(summary.clone());
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────

    fn sms_config(dir: &tempfile::TempDir) -> DispatchConfig {
        DispatchConfig {
            account: AccountRef {
                id: 1,
                name: "main".into(),
            },
            endpoint: "http://gateway.test/send".into(),
            delay: Duration::ZERO,
            recipient_prefix: Some("+254".into()),
            output: dir.path().join("out.csv"),
            ..DispatchConfig::for_channel(ChannelKind::Sms)
        }
    }

    fn sms_headers() -> Vec<String> {
        vec!["first_name".into(), "last_name".into(), "phone".into()]
    }

    fn sms_row(i: usize) -> Row {
        [
            ("first_name", format!("Name{i}")),
            ("last_name", "Otieno".to_string()),
            ("phone", format!("0712{i:06}")),
        ]
        .into_iter()
        .collect()
    }

    fn sms_input(n: usize) -> RunInput {
        let rows: Vec<Row> = (1..=n).map(sms_row).collect();
        RunInput {
            headers: sms_headers(),
            rows: Box::new(rows.into_iter().map(Ok)),
            total: RowCount::Known(n as u64),
            templates: Templates::body(Template::inline("Hi {first_name}")),
        }
    }

    fn dispatcher(
        config: DispatchConfig,
        transport: MockTransport,
        history: Arc<MockHistory>,
    ) -> Dispatcher<MockTransport> {
        let renderer = config.dialect.renderer();
        Dispatcher::new(config, transport, history, renderer)
    }

    fn read_log(path: &Path) -> Vec<HashMap<String, String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().clone();
        reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                headers
                    .iter()
                    .zip(r.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect()
            })
            .collect()
    }

    // ── Delivery ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_with_backoff() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let transport = MockTransport::scripted(Vec::new(), 500);
        let calls = transport.log.clone();

        let started = tokio::time::Instant::now();
        let summary = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(sms_input(1))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(calls.count(), 3);
        assert_eq!(calls.resets.load(Ordering::SeqCst), 2);
        assert!(calls.closed.load(Ordering::SeqCst));
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 0);

        let log = read_log(&output);
        assert_eq!(log[0]["attempts"], "3");
        assert_eq!(log[0]["success"], "false");
        assert_eq!(log[0]["status_code"], "500");
        assert_eq!(log[0]["outcome"], "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transport_error_keeps_last_status() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let transport =
            MockTransport::scripted(vec![Reply::Error("connection reset"), Reply::Status(202)], 500);
        let history = Arc::new(MockHistory::default());

        let summary = dispatcher(config, transport, Arc::clone(&history))
            .run(sms_input(1))
            .await
            .unwrap();

        assert_eq!(summary.sent, 1);
        let log = read_log(&output);
        assert_eq!(log[0]["attempts"], "2");
        assert_eq!(log[0]["success"], "true");
        assert_eq!(log[0]["status_code"], "202");
        assert_eq!(log[0]["recipient_normalized"], "+254712000001");
        assert_eq!(log[0]["message"], "Hi Name1");

        let batches = history.batches.lock().unwrap();
        assert_eq!(batches[0][0].status, SendStatus::Success);
        assert_eq!(batches[0][0].recipient, "+254712000001");
        assert_eq!(batches[0][0].account_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_text_is_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            retries: 0,
            ..sms_config(&tmp)
        };
        let output = config.output.clone();
        let transport = MockTransport::scripted(vec![Reply::Error("connection refused")], 200);

        dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(sms_input(1))
            .await
            .unwrap();

        let log = read_log(&output);
        assert_eq!(log[0]["status_code"], "");
        assert!(log[0]["response"].contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            retries: 0,
            timeout: Duration::from_secs(2),
            ..sms_config(&tmp)
        };
        let output = config.output.clone();
        let transport = MockTransport::scripted(vec![Reply::Hang], 200);

        let started = tokio::time::Instant::now();
        let summary = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(sms_input(1))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(summary.failed, 1);
        assert!(read_log(&output)[0]["response"].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delay_between_sent_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            delay: Duration::from_millis(200),
            ..sms_config(&tmp)
        };

        let started = tokio::time::Instant::now();
        dispatcher(config, MockTransport::ok(), Arc::new(MockHistory::default()))
            .run(sms_input(5))
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1050), "{elapsed:?}");
    }

    // ── Row selection ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_row_and_limit_select_a_window() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("contacts.csv");
        let mut csv = String::from("first_name,last_name,phone\n");
        for i in 1..=10 {
            csv.push_str(&format!("Name{i},Otieno,0712{i:06}\n"));
        }
        std::fs::write(&input, csv).unwrap();

        let config = DispatchConfig {
            start_row: 3,
            limit: 4,
            ..sms_config(&tmp)
        };
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let summary = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run_file(&input, Templates::body(Template::inline("Hi {first_name}")))
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::LimitReached);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.total, RowCount::Known(10));
        assert_eq!(
            calls.recipients(),
            vec![
                "+254712000003",
                "+254712000004",
                "+254712000005",
                "+254712000006"
            ]
        );
        assert_eq!(read_log(&output).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_recipient_is_skipped_without_sending() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();
        let observer = Arc::new(RecordingObserver::default());

        let mut blank = sms_row(1);
        blank.insert("phone", " - ");
        let input = RunInput {
            headers: sms_headers(),
            rows: Box::new(vec![blank, sms_row(2)].into_iter().map(Ok)),
            total: RowCount::Unknown,
            templates: Templates::body(Template::inline("Hi")),
        };

        let summary = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .with_observer(observer.clone())
            .run(input)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(calls.count(), 1);
        let log = read_log(&output);
        assert_eq!(log[0]["outcome"], "no_recipient");
        assert_eq!(log[0]["attempts"], "0");
        assert_eq!(log[0]["success"], "false");
        assert!(observer.progress.lock().unwrap()[0].0.contains("no recipient"));
    }

    #[tokio::test(start_paused = true)]
    async fn recipient_column_matches_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let row: Row = [("Name", "Amy"), ("PHONE", "0712 345 678")].into_iter().collect();
        let input = RunInput {
            headers: vec!["Name".into(), "PHONE".into()],
            rows: Box::new(std::iter::once(Ok(row))),
            total: RowCount::Known(1),
            templates: Templates::body(Template::inline("Hi {Name}")),
        };
        dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(input)
            .await
            .unwrap();

        assert_eq!(calls.recipients(), vec!["+254712345678"]);
    }

    // ── History ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn duplicates_skip_the_transport() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            skip_duplicates: true,
            ..sms_config(&tmp)
        };
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();
        let history = Arc::new(MockHistory {
            sent_today: HashSet::from(["+254712000002".to_string()]),
            ..MockHistory::default()
        });

        let summary = dispatcher(config, transport, Arc::clone(&history))
            .run(sms_input(3))
            .await
            .unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(calls.recipients(), vec!["+254712000001", "+254712000003"]);

        let log = read_log(&output);
        assert_eq!(log[1]["outcome"], "duplicate");
        assert_eq!(log[1]["attempts"], "0");
        assert_eq!(log[1]["success"], "false");
        assert_eq!(log[1]["message"], "");
        assert_eq!(history.batch_sizes(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_never_touches_transport_or_history() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            dry_run: true,
            ..sms_config(&tmp)
        };
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();
        let history = Arc::new(MockHistory::default());

        let summary = dispatcher(config, transport, Arc::clone(&history))
            .run(sms_input(3))
            .await
            .unwrap();

        assert_eq!(calls.count(), 0);
        assert_eq!(summary.dry_run, 3);
        assert_eq!(summary.sent, 0);
        assert!(history.batch_sizes().is_empty());

        for record in read_log(&output) {
            assert_eq!(record["success"], "true");
            assert_eq!(record["attempts"], "0");
            assert_eq!(record["outcome"], "dry_run");
            assert!(record["message"].starts_with("Hi Name"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn history_batches_flush_at_size_and_end() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let history = Arc::new(MockHistory::default());
        let observer = Arc::new(RecordingObserver::default());

        let summary = dispatcher(config, MockTransport::ok(), Arc::clone(&history))
            .with_observer(observer.clone())
            .run(sms_input(250))
            .await
            .unwrap();

        assert_eq!(summary.sent, 250);
        assert_eq!(history.batch_sizes(), vec![100, 100, 50]);

        let marks: Vec<usize> = observer.progress.lock().unwrap().iter().map(|p| p.1).collect();
        assert_eq!(marks, vec![100, 200]);
        assert_eq!(
            observer.completed.lock().unwrap().as_ref().unwrap().stop,
            StopReason::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn history_failures_do_not_abort_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            skip_duplicates: true,
            batch_size: 2,
            ..sms_config(&tmp)
        };
        let history = Arc::new(MockHistory {
            fail_reads: true,
            fail_writes: true,
            ..MockHistory::default()
        });

        let summary = dispatcher(config, MockTransport::ok(), history)
            .run(sms_input(5))
            .await
            .unwrap();

        assert_eq!(summary.sent, 5);
        assert_eq!(summary.skipped, 0);
    }

    // ── Stopping ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_at_row_boundary_and_flushes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let history = Arc::new(MockHistory::default());
        let observer = Arc::new(RecordingObserver::default());

        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let engine = dispatcher(config, transport, Arc::clone(&history))
            .with_observer(observer.clone());
        *calls.cancel_after.lock().unwrap() = Some((3, engine.cancel_handle()));

        let summary = engine.run(sms_input(10)).await.unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.processed, 3);
        assert_eq!(calls.count(), 3);
        assert_eq!(read_log(&output).len(), 3);
        assert_eq!(history.batch_sizes(), vec![3]);
        assert!(observer.completed.lock().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_processes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let engine = dispatcher(config, transport, Arc::new(MockHistory::default()));
        engine.cancel_handle().store(true, Ordering::SeqCst);
        let summary = engine.run(sms_input(3)).await.unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.processed, 0);
        assert_eq!(calls.count(), 0);
        assert!(read_log(&output).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_cap_is_asked_once_and_can_continue() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let history = Arc::new(MockHistory {
            daily: 999,
            ..MockHistory::default()
        });
        let observer = Arc::new(RecordingObserver {
            cap_answer: Some(CapDecision::Continue),
            ..RecordingObserver::default()
        });

        let summary = dispatcher(config, MockTransport::ok(), history)
            .with_observer(observer.clone())
            .run(sms_input(4))
            .await
            .unwrap();

        assert_eq!(summary.sent, 4);
        assert_eq!(observer.cap_asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn declining_the_cap_stops_like_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let transport = MockTransport::ok();
        let calls = transport.log.clone();
        let history = Arc::new(MockHistory {
            daily: 998,
            ..MockHistory::default()
        });
        let observer = Arc::new(RecordingObserver {
            cap_answer: Some(CapDecision::Stop),
            ..RecordingObserver::default()
        });

        let summary = dispatcher(config, transport, Arc::clone(&history))
            .with_observer(observer.clone())
            .run(sms_input(5))
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::CapDeclined);
        assert_eq!(summary.sent, 2);
        assert_eq!(calls.count(), 2);
        assert_eq!(history.batch_sizes(), vec![2]);
        assert_eq!(observer.cap_asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_cap_disables_the_question() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            daily_cap: 0,
            ..sms_config(&tmp)
        };
        let history = Arc::new(MockHistory {
            daily: 5000,
            ..MockHistory::default()
        });
        let observer = Arc::new(RecordingObserver::default());

        let summary = dispatcher(config, MockTransport::ok(), history)
            .with_observer(observer.clone())
            .run(sms_input(2))
            .await
            .unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(observer.cap_asked.load(Ordering::SeqCst), 0);
    }

    // ── Failures ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn mid_run_source_error_flushes_then_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let history = Arc::new(MockHistory::default());
        let observer = Arc::new(RecordingObserver::default());

        let rows: Vec<std::result::Result<Row, SourceError>> = vec![
            Ok(sms_row(1)),
            Err(SourceError::Spreadsheet("truncated sheet".into())),
            Ok(sms_row(3)),
        ];
        let input = RunInput {
            headers: sms_headers(),
            rows: Box::new(rows.into_iter()),
            total: RowCount::Known(3),
            templates: Templates::body(Template::inline("Hi")),
        };

        let err = dispatcher(config, MockTransport::ok(), Arc::clone(&history))
            .with_observer(observer.clone())
            .run(input)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Source(SourceError::Spreadsheet(_))));
        assert_eq!(history.batch_sizes(), vec![1]);
        assert_eq!(read_log(&output).len(), 1);
        assert!(observer.completed.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_input_file_fails_before_any_row() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sms_config(&tmp);
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let err = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run_file(&tmp.path().join("nope.csv"), Templates::body(Template::inline("x")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Source(SourceError::NotFound(_))));
        assert_eq!(calls.count(), 0);
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn uncreatable_output_fails_before_any_row() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let config = DispatchConfig {
            output: blocker.join("out.csv"),
            ..sms_config(&tmp)
        };
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let err = dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(sms_input(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Output(_)));
        assert_eq!(calls.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_endpoint_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            endpoint: String::new(),
            ..sms_config(&tmp)
        };
        let err = dispatcher(config, MockTransport::ok(), Arc::new(MockHistory::default()))
            .run(sms_input(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // ── Email ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn email_rows_use_escaped_dialect_and_subject() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            account: AccountRef {
                id: 2,
                name: "newsletter".into(),
            },
            delay: Duration::ZERO,
            output: tmp.path().join("email.csv"),
            ..DispatchConfig::for_channel(ChannelKind::Email)
        };
        assert_eq!(config.dialect, Dialect::Escaped);
        let output = config.output.clone();
        let transport = MockTransport::ok();
        let calls = transport.log.clone();

        let row: Row = [("email", "  amy.o@example.com "), ("name", "Amy")]
            .into_iter()
            .collect();
        let input = RunInput {
            headers: vec!["email".into(), "name".into()],
            rows: Box::new(std::iter::once(Ok(row))),
            total: RowCount::Known(1),
            templates: Templates::body(Template::inline(
                "<style>p{color:red}</style><p>Hi {{ name }}</p>",
            ))
            .with_subject(Template::inline("News for {{name_upper}}")),
        };

        dispatcher(config, transport, Arc::new(MockHistory::default()))
            .run(input)
            .await
            .unwrap();

        let sent = calls.calls.lock().unwrap();
        assert_eq!(sent[0].0, "amy.o@example.com");
        assert_eq!(sent[0].1.as_deref(), Some("News for AMY"));
        assert_eq!(sent[0].2, "<style>p{color:red}</style><p>Hi Amy</p>");

        let log = read_log(&output);
        assert_eq!(log[0]["subject"], "News for AMY");
        assert_eq!(log[0]["recipient_normalized"], "amy.o@example.com");
    }
}
