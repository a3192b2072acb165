//! Staged connectivity diagnosis.
//!
//! `DiagnosticRunner::test_connection` walks the path to the broker one layer
//! at a time (service, DNS, TCP/TLS, MQTT session, publish) and streams a
//! [`TestResult`] per step, so the operator sees exactly where it breaks.

use std::{future::Future, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    backoff::Backoff,
    connection::ConnectionManager,
    error::ClientError,
    event::EventDto,
    precheck::{self, BrokerUrl},
    tls, Result,
};

/// Message sent on the control channel when the service is found stopped.
pub const RECONFIGURE_SIGNAL: &str = "reconfigure";

pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(5);
pub const BROKER_TIMEOUT: Duration = Duration::from_secs(10);
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(12);

const SERVICE_START_ATTEMPTS: u32 = 3;
const DEFAULT_TEST_TOPIC: &str = "birdnet-go/test";
const RESULT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ServiceCheck,
    ServiceStart,
    DnsResolution,
    TcpConnection,
    BrokerConnection,
    MessagePublishing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ServiceCheck => "Service Check",
            Stage::ServiceStart => "Service Start",
            Stage::DnsResolution => "DNS Resolution",
            Stage::TcpConnection => "TCP Connection",
            Stage::BrokerConnection => "Broker Connection",
            Stage::MessagePublishing => "Message Publishing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

/// One entry of the diagnostic stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub is_progress: bool,
    pub state: TestState,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TestResult {
    fn new(stage: Stage, success: bool, state: TestState, message: String) -> Self {
        Self {
            success,
            stage: stage.to_string(),
            message,
            error: None,
            is_progress: false,
            state,
            timestamp: now_rfc3339(),
        }
    }

    pub fn progress(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            is_progress: true,
            ..Self::new(stage, true, TestState::Running, message.into())
        }
    }

    pub fn completed(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, true, TestState::Completed, message.into())
    }

    pub fn failed(stage: Stage, err: &ClientError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(
                stage,
                false,
                TestState::Failed,
                format!("Failed to perform {stage} ({})", err.category()),
            )
        }
    }

    pub fn timed_out(stage: Stage) -> Self {
        Self {
            error: Some("operation timeout".into()),
            ..Self::new(
                stage,
                false,
                TestState::Timeout,
                format!("{stage} operation timed out"),
            )
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self {
            error: Some("operation cancelled".into()),
            ..Self::new(
                stage,
                false,
                TestState::Cancelled,
                format!("{stage} operation cancelled"),
            )
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// `<topic>/test`, or `birdnet-go/test` without a configured topic.
pub fn derive_test_topic(topic: &str) -> String {
    match topic.trim().trim_end_matches('/') {
        "" => DEFAULT_TEST_TOPIC.to_string(),
        base => format!("{base}/test"),
    }
}

/// Detection published by the last stage.
pub fn synthetic_event() -> EventDto {
    let now = OffsetDateTime::now_utc();
    EventDto {
        date: now
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_default(),
        time: now
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default(),
        common_name: "Whooper Swan".into(),
        scientific_name: "Cygnus cygnus".into(),
        confidence: 0.95,
        latitude: 0.0,
        longitude: 0.0,
        clip_name: String::new(),
        processing_time: Duration::ZERO,
        occurrence: 0.0,
        detection_id: 0,
        source_id: "mqtt_test".into(),
        bird_image: None,
    }
}

/// Sending half of the result stream.
struct Reporter {
    tx: mpsc::Sender<TestResult>,
}

impl Reporter {
    /// Returns `false` once the receiver is gone.
    async fn send(&self, result: TestResult) -> bool {
        match result.state {
            TestState::Running | TestState::Completed => {
                debug!(stage = %result.stage, "{}", result.message)
            }
            _ => warn!(
                stage = %result.stage,
                error = result.error.as_deref().unwrap_or_default(),
                "{}",
                result.message
            ),
        }
        self.tx.send(result).await.is_ok()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Clone)]
pub struct DiagnosticRunner {
    manager: ConnectionManager,
    control: Option<mpsc::Sender<String>>,
}

impl DiagnosticRunner {
    /// `control` receives [`RECONFIGURE_SIGNAL`] when the service is found
    /// disconnected.
    pub fn new(manager: ConnectionManager, control: Option<mpsc::Sender<String>>) -> Self {
        Self { manager, control }
    }

    /// Starts a diagnosis in the background and returns its result stream.
    ///
    /// The stream ends after the publish stage or the first failed stage.
    /// Dropping the receiver or cancelling `cancel` stops the run.
    pub fn test_connection(&self, cancel: &CancellationToken) -> mpsc::Receiver<TestResult> {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let runner = self.clone();
        let token = cancel.child_token();
        let span = info_span!("mqtt_diagnostics", broker = %self.manager.broker());

        tokio::spawn(
            async move {
                let _guard = token.clone().drop_guard();
                let reporter = Reporter { tx };
                runner.run(&reporter, &token).await;
                info!("Diagnostic run finished");
            }
            .instrument(span),
        );

        rx
    }

    async fn run(&self, reporter: &Reporter, cancel: &CancellationToken) {
        if let Flow::Stop = self.check_service(reporter, cancel).await {
            return;
        }

        let broker = self.manager.broker().clone();

        if broker.is_ip_literal() {
            let stage = Stage::DnsResolution;
            if !reporter
                .send(TestResult::progress(stage, format!("Running {stage} test...")))
                .await
            {
                return;
            }
            let skipped = format!("Broker address {} is an IP literal, lookup skipped", broker.host);
            if !reporter.send(TestResult::completed(stage, skipped)).await {
                return;
            }
        } else {
            let host = broker.host.clone();
            let port = broker.port;
            let passed = self
                .run_stage(reporter, cancel, Stage::DnsResolution, DNS_TIMEOUT, |token| async move {
                    let addrs = precheck::resolve_host(&host, port, DNS_TIMEOUT, &token).await?;
                    debug!(host = %host, resolved = addrs.len(), "Broker host resolved");
                    Ok(())
                })
                .await;
            if !passed {
                return;
            }
        }

        let config = self.manager.config().clone();
        let probe = broker.clone();
        let passed = self
            .run_stage(reporter, cancel, Stage::TcpConnection, TCP_TIMEOUT, |_| async move {
                let tls = config.tls_enabled().then_some(&config.tls);
                probe_tcp(&probe, tls).await
            })
            .await;
        if !passed {
            return;
        }

        if self.manager.is_connected() {
            let stage = Stage::BrokerConnection;
            if !reporter
                .send(TestResult::progress(stage, format!("Running {stage} test...")))
                .await
            {
                return;
            }
            if !reporter
                .send(TestResult::completed(stage, "Already connected to MQTT broker"))
                .await
            {
                return;
            }
        } else {
            let manager = self.manager.clone();
            let passed = self
                .run_stage(reporter, cancel, Stage::BrokerConnection, BROKER_TIMEOUT, |token| {
                    connect_after_cooldown(manager, token)
                })
                .await;
            if !passed {
                return;
            }
        }

        let manager = self.manager.clone();
        let topic = derive_test_topic(&manager.config().topic);
        self.run_stage(reporter, cancel, Stage::MessagePublishing, PUBLISH_TIMEOUT, |token| {
            async move {
                let payload = synthetic_event().to_json()?;
                manager.publish(&token, &topic, payload).await?;
                info!(topic = %topic, "Published diagnostic message");
                Ok(())
            }
        })
        .await;
    }

    /// Brings the service up when it is down. Only ever emits progress.
    async fn check_service(&self, reporter: &Reporter, cancel: &CancellationToken) -> Flow {
        let stage = Stage::ServiceCheck;
        if cancel.is_cancelled() {
            reporter.send(TestResult::cancelled(stage)).await;
            return Flow::Stop;
        }
        if !reporter
            .send(TestResult::progress(stage, format!("Running {stage} test...")))
            .await
        {
            return Flow::Stop;
        }

        if self.manager.is_connected() {
            return report(reporter, TestResult::progress(stage, "MQTT service is running")).await;
        }

        let stage = Stage::ServiceStart;
        if let Some(control) = &self.control {
            match control.try_send(RECONFIGURE_SIGNAL.to_string()) {
                Ok(()) => {
                    if let Flow::Stop = report(
                        reporter,
                        TestResult::progress(stage, "Requested MQTT service reconfiguration"),
                    )
                    .await
                    {
                        return Flow::Stop;
                    }
                }
                Err(e) => warn!("Failed to send reconfigure signal: {e}"),
            }
        }

        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(2))
            .with_max_attempts(SERVICE_START_ATTEMPTS - 1);

        for attempt in 1..=SERVICE_START_ATTEMPTS {
            let message = format!("Starting MQTT service (attempt {attempt}/{SERVICE_START_ATTEMPTS})...");
            if let Flow::Stop = report(reporter, TestResult::progress(stage, message)).await {
                return Flow::Stop;
            }

            let outcome = tokio::select! {
                biased;
                _ = reporter.closed() => return Flow::Stop,
                result = self.manager.connect(cancel) => result,
            };

            let wait = match outcome {
                Ok(()) => {
                    return report(reporter, TestResult::progress(stage, "MQTT service started"))
                        .await;
                }
                Err(ClientError::Cancelled(_)) => {
                    reporter.send(TestResult::cancelled(stage)).await;
                    return Flow::Stop;
                }
                Err(ClientError::Cooldown { remaining }) => Some(remaining),
                Err(e) => {
                    debug!(attempt, "Service start attempt failed: {e}");
                    backoff.next_sleep().ok()
                }
            };

            let Some(wait) = wait.filter(|_| attempt < SERVICE_START_ATTEMPTS) else {
                break;
            };
            let message = format!("Waiting {:.1}s before retrying", wait.as_secs_f64());
            if let Flow::Stop = report(reporter, TestResult::progress(stage, message)).await {
                return Flow::Stop;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    reporter.send(TestResult::cancelled(stage)).await;
                    return Flow::Stop;
                }
                _ = reporter.closed() => return Flow::Stop,
                _ = sleep(wait) => {}
            }
        }

        report(
            reporter,
            TestResult::progress(stage, "MQTT service did not start, continuing diagnostics"),
        )
        .await
    }

    /// Runs one bounded stage and reports its outcome. Returns whether the
    /// run may continue.
    async fn run_stage<F, Fut>(
        &self,
        reporter: &Reporter,
        cancel: &CancellationToken,
        stage: Stage,
        limit: Duration,
        op: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !reporter
            .send(TestResult::progress(stage, format!("Running {stage} test...")))
            .await
        {
            return false;
        }

        let token = cancel.child_token();
        let _guard = token.clone().drop_guard();

        let result = tokio::select! {
            biased;
            _ = reporter.closed() => return false,
            _ = cancel.cancelled() => TestResult::cancelled(stage),
            outcome = timeout(limit, op(token.clone())) => match outcome {
                Err(_) => TestResult::timed_out(stage),
                Ok(Ok(())) => TestResult::completed(stage, format!("Successfully completed {stage}")),
                Ok(Err(ClientError::Cancelled(_))) => TestResult::cancelled(stage),
                Ok(Err(e)) if e.is_timeout() => TestResult {
                    error: Some(e.to_string()),
                    ..TestResult::timed_out(stage)
                },
                Ok(Err(e)) => TestResult::failed(stage, &e),
            },
        };

        let passed = result.success;
        reporter.send(result).await && passed
    }
}

/// Connects, waiting out a cooldown left by the service start attempts so the
/// stage reports the broker's own answer.
async fn connect_after_cooldown(manager: ConnectionManager, cancel: CancellationToken) -> Result<()> {
    loop {
        match manager.connect(&cancel).await {
            Err(ClientError::Cooldown { remaining }) => {
                debug!(?remaining, "Waiting for connect cooldown");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled("connect")),
                    _ = sleep(remaining) => {}
                }
            }
            outcome => return outcome,
        }
    }
}

async fn report(reporter: &Reporter, result: TestResult) -> Flow {
    if reporter.send(result).await {
        Flow::Continue
    } else {
        Flow::Stop
    }
}

/// Opens a TCP connection and, with TLS on, completes a handshake.
async fn probe_tcp(broker: &BrokerUrl, tls: Option<&crate::config::TlsConfig>) -> Result<()> {
    let stream = TcpStream::connect(broker.address()).await?;
    debug!(peer = ?stream.peer_addr().ok(), "TCP connection established");

    let Some(tls) = tls else {
        return Ok(());
    };

    let connector = TlsConnector::from(Arc::new(tls::build_client_config(tls)?));
    let server_name = ServerName::try_from(broker.host.clone())
        .map_err(|e| ClientError::TlsMaterial(format!("invalid server name {}: {e}", broker.host)))?;
    let mut stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::Handshake(format!("TLS handshake failed: {e}")))?;
    debug!("TLS handshake completed");
    let _ = stream.shutdown().await;
    Ok(())
}
