use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{WorkerConfig, DECODER_NICE_DEFAULT};
use crate::protocol::{ServerMessage, TranscriptResult, TranscriptSegment, EOF_CONTROL_MESSAGE};

/// Size of one decoded audio chunk sent to the remote endpoint.
const AUDIO_CHUNK_SIZE: usize = 8192;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dry-run modes that bypass the real pipeline for operational testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DryRunMode {
    /// Run the real pipeline
    #[default]
    Disabled,
    /// Fabricate an immediate success with an empty transcript
    FakeSuccess,
    /// Fabricate an immediate endpoint-unavailable failure
    FakeFailure,
}

/// Classified pipeline failures.
///
/// The distinction between `EndpointUnavailable` and `Stream` drives the
/// orchestrator's retry policy: the former is attributed to the worker,
/// the latter to the connection.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The remote connection could not be established
    #[error("failed connecting to {url}: {reason}")]
    EndpointUnavailable { url: String, reason: String },

    /// Transport failure after the connection was established
    #[error("communication error with {url}: {reason}")]
    Stream { url: String, reason: String },

    /// The local decode subprocess exited non-zero
    #[error("audio decoder exited with code {code}")]
    Decode { code: i32 },

    /// The local decode subprocess could not be started
    #[error("failed to spawn audio decoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A unit of work runnable against an acquired worker.
///
/// The pool hands a worker's configuration to the task and expects a
/// transcript or a classified failure back.
#[async_trait]
pub trait PoolTask: Send + Sync {
    async fn run(&self, worker: &WorkerConfig) -> Result<TranscriptResult, PipelineError>;
}

/// Per-file transcription pipeline: decode the source media locally and
/// stream it to the worker's remote endpoint.
#[derive(Debug, Clone)]
pub struct TranscribeTask {
    file_path: PathBuf,
    dry_run: DryRunMode,
}

impl TranscribeTask {
    pub fn new(file_path: impl Into<PathBuf>, dry_run: DryRunMode) -> Self {
        Self {
            file_path: file_path.into(),
            dry_run,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    async fn transcribe(&self, worker: &WorkerConfig) -> Result<TranscriptResult, PipelineError> {
        let mut ws = connect(worker).await?;
        let started = Instant::now();

        let command = decoder_command(&self.file_path, worker.decoder_nice);
        let outcome = run_duplex(worker, command, &mut ws).await;

        // The remote connection is closed on every exit path
        let _ = ws.close(None).await;

        let segments = outcome?;
        debug!(
            "Worker {} finished {} in {:.1}s ({} segment(s))",
            worker.id,
            self.file_path.display(),
            started.elapsed().as_secs_f64(),
            segments.len()
        );

        Ok(
            TranscriptResult::new(&worker.id, self.file_path.to_string_lossy())
                .with_segments(segments),
        )
    }
}

#[async_trait]
impl PoolTask for TranscribeTask {
    async fn run(&self, worker: &WorkerConfig) -> Result<TranscriptResult, PipelineError> {
        match self.dry_run {
            DryRunMode::Disabled => {
                info!(
                    "Worker {} transcribing {}",
                    worker.id,
                    self.file_path.display()
                );
                self.transcribe(worker).await
            }
            DryRunMode::FakeSuccess => {
                info!(
                    "Worker {}: dry-run enabled, returning fake success for {}",
                    worker.id,
                    self.file_path.display()
                );
                Ok(TranscriptResult::new(
                    &worker.id,
                    self.file_path.to_string_lossy(),
                ))
            }
            DryRunMode::FakeFailure => {
                info!(
                    "Worker {}: dry-run enabled, returning fake failure for {}",
                    worker.id,
                    self.file_path.display()
                );
                Err(PipelineError::EndpointUnavailable {
                    url: worker.url.clone(),
                    reason: "dry-run fake failure".to_string(),
                })
            }
        }
    }
}

/// Establish the websocket connection with separate TCP and handshake
/// timeouts and a bounded number of attempts. Every failure here is an
/// endpoint-unavailable failure; connection establishment is never
/// retried beyond `connect_retry` within one pipeline instance.
async fn connect(worker: &WorkerConfig) -> Result<WsStream, PipelineError> {
    info!("Worker {} connecting to {}", worker.id, worker.url);

    let mut last_error = String::new();
    for attempt in 0..=worker.connect_retry {
        match try_connect(worker).await {
            Ok(ws) => {
                info!("Worker {} connected to {}", worker.id, worker.url);
                return Ok(ws);
            }
            Err(reason) => {
                if attempt < worker.connect_retry {
                    warn!(
                        "Worker {}: connection attempt {} failed: {}",
                        worker.id,
                        attempt + 1,
                        reason
                    );
                }
                last_error = reason;
            }
        }
    }

    error!(
        "Worker {} failed connecting to {}: {}",
        worker.id, worker.url, last_error
    );
    Err(PipelineError::EndpointUnavailable {
        url: worker.url.clone(),
        reason: last_error,
    })
}

async fn try_connect(worker: &WorkerConfig) -> Result<WsStream, String> {
    let (host, port) = endpoint_addr(&worker.url)?;

    let tcp = timeout(
        worker.tcp_connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| format!("TCP connect to {}:{} timed out", host, port))?
    .map_err(|e| format!("TCP connect to {}:{} failed: {}", host, port, e))?;
    tcp.set_nodelay(true).map_err(|e| e.to_string())?;

    let (ws, _response) = timeout(
        worker.tls_handshake_timeout,
        client_async_tls(worker.url.as_str(), tcp),
    )
    .await
    .map_err(|_| "websocket handshake timed out".to_string())?
    .map_err(|e| format!("websocket handshake failed: {}", e))?;

    Ok(ws)
}

/// Extract host and port from a ws:// or wss:// URL.
fn endpoint_addr(url: &str) -> Result<(String, u16), String> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("ws://") {
        (rest, 80)
    } else if let Some(rest) = url.strip_prefix("wss://") {
        (rest, 443)
    } else {
        return Err(format!("unsupported endpoint URL: {}", url));
    };

    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => Ok((host.to_string(), port)),
            Err(_) => Err(format!("invalid port in endpoint URL: {}", url)),
        },
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Build the local decode command: mono 16-bit signed PCM at 16 kHz on
/// stdout. `-hide_banner -loglevel quiet` keep stderr traffic minimal;
/// the stream is drained separately so the decoder can never stall on a
/// full pipe.
fn decoder_command(path: &Path, nice: Option<i32>) -> Command {
    let nice = match nice {
        Some(n) if (-20..=19).contains(&n) => n,
        Some(_) => DECODER_NICE_DEFAULT,
        None => DECODER_NICE_DEFAULT,
    };

    let mut cmd = if nice != 0 {
        let mut cmd = Command::new("nice");
        cmd.arg(format!("-n{}", nice)).arg("ffmpeg");
        cmd
    } else {
        Command::new("ffmpeg")
    };

    cmd.args(["-hide_banner", "-loglevel", "quiet", "-i"])
        .arg(path)
        .args(["-f", "wav", "-ac", "1", "-c:a", "pcm_s16le", "-ar", "16000", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// The main duplex loop: one decoded chunk out, one inbound message in,
/// strictly alternating, until the decoder's output is exhausted. Then
/// the end-of-stream control message is sent and the decoder's exit code
/// checked.
async fn run_duplex(
    worker: &WorkerConfig,
    mut command: Command,
    ws: &mut WsStream,
) -> Result<Vec<TranscriptSegment>, PipelineError> {
    let mut child = command.spawn().map_err(PipelineError::Spawn)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::Io(std::io::Error::other("decoder stdout was not captured")))?;
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        });
    }

    let mut segments = Vec::new();
    let mut chunk = vec![0u8; AUDIO_CHUNK_SIZE];
    loop {
        let n = stdout.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        ws.send(Message::binary(chunk[..n].to_vec()))
            .await
            .map_err(|e| stream_error(worker, e.to_string()))?;

        match ws.next().await {
            Some(Ok(Message::Text(frame))) => {
                if let Some(segment) =
                    ServerMessage::parse(frame.as_str()).and_then(ServerMessage::into_segment)
                {
                    debug!("Worker {} recognized: {}", worker.id, segment.text);
                    segments.push(segment);
                }
            }
            // Other message kinds are consumed off the stream but ignored
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(stream_error(worker, e.to_string())),
            None => {
                return Err(stream_error(
                    worker,
                    "connection closed mid-stream".to_string(),
                ))
            }
        }
    }

    ws.send(Message::text(EOF_CONTROL_MESSAGE))
        .await
        .map_err(|e| stream_error(worker, e.to_string()))?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(PipelineError::Decode {
            code: status.code().unwrap_or(-1),
        });
    }
    debug!("Worker {}: decoder exited successfully", worker.id);

    Ok(segments)
}

fn stream_error(worker: &WorkerConfig, reason: String) -> PipelineError {
    error!(
        "Worker {}: communication error with {}: {}",
        worker.id, worker.url, reason
    );
    PipelineError::Stream {
        url: worker.url.clone(),
        reason,
    }
}
