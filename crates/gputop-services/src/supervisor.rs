use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gputop_core::{ProducerConfig, TelemetrySnapshot};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::reader::SnapshotReader;
use crate::sink::MetricsSink;

/// How long output may stay idle after the producer exits before it is abandoned.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Error starting {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} stdout was not captured")]
    MissingStdout { program: String },
    #[error("Error reading {program} output: {source}")]
    StreamFault {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lifecycle of the producer process and the pipeline reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Shared view of the pipeline state and every transition it went through.
#[derive(Clone)]
pub struct PipelineStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    current: watch::Sender<SupervisorState>,
    history: Mutex<Vec<SupervisorState>>,
}

impl PipelineStatus {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SupervisorState::Starting);
        Self {
            inner: Arc::new(StatusInner {
                current,
                history: Mutex::new(vec![SupervisorState::Starting]),
            }),
        }
    }

    pub fn current(&self) -> SupervisorState {
        *self.inner.current.borrow()
    }

    pub fn history(&self) -> Vec<SupervisorState> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.current.subscribe()
    }

    fn set(&self, next: SupervisorState) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if history.last() == Some(&next) {
            return;
        }
        history.push(next);
        self.inner.current.send_replace(next);
        debug!(state = ?next, "Pipeline state changed");
    }
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the telemetry producer and forwards its snapshots into a sink.
pub struct Supervisor {
    config: ProducerConfig,
    sink: Arc<dyn MetricsSink>,
}

impl Supervisor {
    pub fn new(config: ProducerConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink }
    }

    /// Spawn the pipeline on the current tokio runtime.
    ///
    /// Whatever way the pipeline ends, the returned token is cancelled.
    #[instrument(skip(self), fields(program = %self.config.program))]
    pub fn start(self) -> Pipeline {
        info!("Starting telemetry pipeline");

        Pipeline::spawn(|token, status| async move {
            let result = self.drive(&token, &status).await;
            self.finish(result, &token, &status)
        })
    }

    /// Run the pipeline over an already open feed instead of a subprocess.
    #[cfg(test)]
    fn start_attached<R>(self, feed: R) -> Pipeline
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Pipeline::spawn(|token, status| async move {
            status.set(SupervisorState::Running);
            let exited = CancellationToken::new();
            let result = self.forward(feed, &token, &exited, &status).await;
            self.finish(result, &token, &status)
        })
    }

    fn finish(
        &self,
        result: Result<(), SupervisorError>,
        token: &CancellationToken,
        status: &PipelineStatus,
    ) -> Result<(), SupervisorError> {
        status.set(SupervisorState::Terminated);
        token.cancel();

        match &result {
            Ok(()) => info!(program = %self.config.program, "Telemetry pipeline terminated"),
            Err(e) => error!(error = %e, "Telemetry pipeline failed"),
        }
        result
    }

    async fn drive(
        &self,
        token: &CancellationToken,
        status: &PipelineStatus,
    ) -> Result<(), SupervisorError> {
        if token.is_cancelled() {
            debug!("Cancelled before producer launch");
            return Ok(());
        }

        let (child, stdout) = self.launch()?;
        info!(pid = ?child.id(), "Producer started");

        let exited = CancellationToken::new();
        let watcher = tokio::spawn(watch_child(
            child,
            token.clone(),
            exited.clone(),
            self.config.program.clone(),
        ));
        status.set(SupervisorState::Running);

        let result = self
            .forward(BufReader::new(stdout), token, &exited, status)
            .await;

        // The watcher only returns once the producer is dead or reaped.
        token.cancel();
        if let Err(e) = watcher.await {
            warn!(error = %e, "Producer watcher failed");
        }
        result
    }

    fn launch(&self) -> Result<(Child, ChildStdout), SupervisorError> {
        let program = &self.config.program;

        let mut child = Command::new(program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::MissingStdout {
                program: program.clone(),
            })?;

        Ok((child, stdout))
    }

    /// Forward snapshots until the feed ends, the producer goes quiet after
    /// exiting, or `token` is cancelled.
    async fn forward<R>(
        &self,
        feed: R,
        token: &CancellationToken,
        exited: &CancellationToken,
        status: &PipelineStatus,
    ) -> Result<(), SupervisorError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut reader = SnapshotReader::new(feed);
        let mut forwarded: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    status.set(SupervisorState::Draining);
                    info!(forwarded, "Cancelled, stopping metrics collection");
                    break;
                }
                next = next_row(&mut reader, exited) => match next {
                    Some(snapshot) => {
                        self.sink.observe(snapshot);
                        forwarded += 1;
                    }
                    None => {
                        warn!(forwarded, rows = reader.rows_read(), "Producer output ended");
                        break;
                    }
                },
            }
        }

        match reader.take_fault() {
            Some(source) => Err(SupervisorError::StreamFault {
                program: self.config.program.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Next snapshot, giving up once the producer has exited and the feed has been
/// idle for [`EXIT_GRACE`].
async fn next_row<R>(
    reader: &mut SnapshotReader<R>,
    exited: &CancellationToken,
) -> Option<TelemetrySnapshot>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        next = reader.next_snapshot() => next,
        _ = async {
            exited.cancelled().await;
            tokio::time::sleep(EXIT_GRACE).await;
        } => {
            info!("Producer exited but its output is still open, abandoning it");
            None
        }
    }
}

/// Kill the producer on cancellation, or reap it and raise `exited` if it
/// exits first.
async fn watch_child(
    mut child: Child,
    token: CancellationToken,
    exited: CancellationToken,
    program: String,
) {
    tokio::select! {
        _ = token.cancelled() => {
            info!(%program, "Terminating producer due to cancellation");
            if let Err(e) = child.kill().await {
                warn!(%program, error = %e, "Failed to kill producer");
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => info!(%program, "Producer exited"),
                Ok(status) => warn!(%program, %status, "Producer exited unexpectedly"),
                Err(e) => warn!(%program, error = %e, "Failed to wait for producer"),
            }
            exited.cancel();
        }
    }
}

/// Handle to a running pipeline.
pub struct Pipeline {
    token: CancellationToken,
    status: PipelineStatus,
    handle: JoinHandle<Result<(), SupervisorError>>,
}

impl Pipeline {
    fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken, PipelineStatus) -> Fut,
        Fut: std::future::Future<Output = Result<(), SupervisorError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let status = PipelineStatus::new();
        let handle = tokio::spawn(run(token.clone(), status.clone()));

        Self {
            token,
            status,
            handle,
        }
    }

    /// Stop the pipeline. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("Cancelling telemetry pipeline");
        }
        self.token.cancel();
    }

    /// Shared token, cancelled whenever the pipeline stops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.clone()
    }

    pub fn current_state(&self) -> SupervisorState {
        self.status.current()
    }

    /// Wait for the pipeline to reach `Terminated`.
    pub async fn wait(self) -> Result<(), SupervisorError> {
        self.handle.await?
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::ScriptedFeed;
    use super::SupervisorState::{Draining, Running, Starting, Terminated};

    const HEADER: &str = "Freq MHz req,Freq MHz act,IRQ /s,RC6 %,RCS %,RCS se,RCS wa,BCS %,BCS se,BCS wa,VCS %,VCS se,VCS wa,VECS %,VECS se,VECS wa";
    const ROW_1: &str = "1200.0,1150.0,500.0,85.5,10.2,5.1,2.3,15.4,7.8,3.2,8.9,4.5,1.8,12.7,6.3,2.9";
    const ROW_2: &str = "1300.0,1250.0,600.0,90.0,20.5,10.2,4.6,25.8,15.6,6.4,18.8,9.0,3.6,25.4,12.6,5.8";

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<TelemetrySnapshot>>,
    }

    impl RecordingSink {
        fn len(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl MetricsSink for RecordingSink {
        fn observe(&self, snapshot: TelemetrySnapshot) {
            self.seen.lock().unwrap().push(snapshot);
        }
    }

    fn shell(script: String) -> ProducerConfig {
        ProducerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script],
        }
    }

    fn echo_lines(lines: &[&str]) -> String {
        lines
            .iter()
            .map(|line| format!("echo '{}'", line))
            .collect::<Vec<_>>()
            .join("; ")
    }

    async fn wait_for_snapshots(sink: &RecordingSink, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("snapshots should arrive");
    }

    #[tokio::test]
    async fn test_launch_failure_terminates() {
        let sink = Arc::new(RecordingSink::default());
        let config = ProducerConfig {
            program: "/nonexistent/gputop-producer".to_string(),
            args: vec![],
        };
        let pipeline = Supervisor::new(config, sink.clone()).start();
        let token = pipeline.token();
        let status = pipeline.status();

        let result = pipeline.wait().await;
        assert!(matches!(result, Err(SupervisorError::Launch { .. })));
        assert!(token.is_cancelled());
        assert_eq!(status.history(), vec![Starting, Terminated]);
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn test_producer_exit_forwards_rows_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let script = echo_lines(&[HEADER, ROW_1, "1200.0,1150.0", ROW_2]);
        let pipeline = Supervisor::new(shell(script), sink.clone()).start();
        let token = pipeline.token();
        let status = pipeline.status();

        let result = tokio::time::timeout(Duration::from_secs(10), pipeline.wait())
            .await
            .expect("pipeline should end with its producer");
        assert!(result.is_ok());
        assert!(token.is_cancelled());
        assert_eq!(status.history(), vec![Starting, Running, Terminated]);

        let seen = sink.seen.lock().unwrap();
        let freqs: Vec<f64> = seen.iter().map(|s| s.freq_requested_mhz).collect();
        assert_eq!(freqs, vec![1200.0, 1300.0]);
    }

    #[tokio::test]
    async fn test_cancel_walks_every_state() {
        let sink = Arc::new(RecordingSink::default());
        let script = format!("{}; exec sleep 30", echo_lines(&[HEADER, ROW_1]));
        let pipeline = Supervisor::new(shell(script), sink.clone()).start();
        let status = pipeline.status();
        let mut updates = status.subscribe();

        wait_for_snapshots(&sink, 1).await;
        assert_eq!(pipeline.current_state(), Running);

        pipeline.cancel();
        pipeline.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), pipeline.wait())
            .await
            .expect("cancelled pipeline should stop promptly");
        assert!(result.is_ok());
        assert_eq!(
            status.history(),
            vec![Starting, Running, Draining, Terminated]
        );
        assert_eq!(*updates.borrow_and_update(), Terminated);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_exited_producer_with_open_stdout_shuts_down() {
        let sink = Arc::new(RecordingSink::default());
        let script = format!("{}; sleep 5 & exit 0", echo_lines(&[HEADER, ROW_1]));
        let pipeline = Supervisor::new(shell(script), sink.clone()).start();
        let token = pipeline.token();
        let status = pipeline.status();

        let result = tokio::time::timeout(Duration::from_secs(3), pipeline.wait())
            .await
            .expect("pipeline should not outlive its producer");
        assert!(result.is_ok());
        assert!(token.is_cancelled());
        assert_eq!(status.history(), vec![Starting, Running, Terminated]);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_producer_still_shuts_down() {
        let sink = Arc::new(RecordingSink::default());
        let script = format!("{}; exit 3", echo_lines(&[ROW_1]));
        let pipeline = Supervisor::new(shell(script), sink.clone()).start();
        let token = pipeline.token();

        let result = tokio::time::timeout(Duration::from_secs(10), pipeline.wait())
            .await
            .expect("pipeline should end with its producer");
        assert!(result.is_ok());
        assert!(token.is_cancelled());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_fault_fails_pipeline() {
        let sink = Arc::new(RecordingSink::default());
        let feed = ScriptedFeed::new(vec![
            Ok(format!("{HEADER}\n{ROW_1}\n").into_bytes()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
            Ok(format!("{ROW_2}\n").into_bytes()),
        ]);
        let pipeline = Supervisor::new(shell(String::new()), sink.clone())
            .start_attached(BufReader::new(feed));
        let token = pipeline.token();
        let status = pipeline.status();

        let result = pipeline.wait().await;
        match result {
            Err(SupervisorError::StreamFault { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe)
            }
            other => panic!("expected stream fault, got {:?}", other),
        }
        assert!(token.is_cancelled());
        assert_eq!(status.history(), vec![Starting, Running, Terminated]);
        assert_eq!(sink.len(), 1);
    }
}
