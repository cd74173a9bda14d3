//! One ServerQuery session.
//!
//! A background task owns the socket. Commands are queued over an mpsc channel and answered
//! through a oneshot, one at a time, in submission order. `notify*` lines arriving at any
//! point are forwarded to the event channel. While idle the task sends `whoami` so the
//! server does not drop the session.

use super::codec::{Command, ERROR_EMPTY_RESULT, Notification, QueryStatus, Record, parse_records};
use crate::domain::DomainError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

const REQUEST_QUEUE: usize = 32;
const BANNER: &str = "TS3";

/// Events pushed by the server.
pub type EventStream = mpsc::UnboundedReceiver<Notification>;

/// Full reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: QueryStatus,
    pub records: Vec<Record>,
}

impl Reply {
    /// Records of a successful reply. "empty result set" counts as success with no records.
    pub fn into_records(self, command: &str) -> Result<Vec<Record>, DomainError> {
        if self.status.is_ok() {
            Ok(self.records)
        } else if self.status.id == ERROR_EMPTY_RESULT {
            Ok(Vec::new())
        } else {
            Err(DomainError::ChatUnavailable(format!(
                "{} failed: {}",
                command, self.status
            )))
        }
    }
}

struct Request {
    line: String,
    /// `None` for keepalives.
    reply: Option<oneshot::Sender<Reply>>,
}

struct InFlight {
    reply: Option<oneshot::Sender<Reply>>,
    records: Vec<Record>,
}

fn closed() -> DomainError {
    DomainError::ChatUnavailable("ServerQuery connection closed".into())
}

pub struct QueryConnection {
    requests: mpsc::Sender<Request>,
    call_timeout: Duration,
}

impl QueryConnection {
    pub async fn connect(
        addr: &str,
        call_timeout: Duration,
        keepalive: Duration,
    ) -> Result<(Self, EventStream), DomainError> {
        let stream = tokio::time::timeout(call_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DomainError::ChatUnavailable(format!("connect to {} timed out", addr)))?
            .map_err(|e| DomainError::ChatUnavailable(format!("connect to {}: {}", addr, e)))?;
        let (reader, writer) = stream.into_split();
        Self::start(reader, writer, call_timeout, keepalive).await
    }

    /// Read the welcome banner and hand the streams to the session task.
    pub async fn start<R, W>(
        reader: R,
        writer: W,
        call_timeout: Duration,
        keepalive: Duration,
    ) -> Result<(Self, EventStream), DomainError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        let banner = tokio::time::timeout(call_timeout, next_line(&mut lines))
            .await
            .map_err(|_| DomainError::ChatUnavailable("no ServerQuery banner".into()))??;
        if banner != BANNER {
            return Err(DomainError::ChatUnavailable(format!(
                "unexpected banner {:?}",
                banner
            )));
        }
        let welcome = tokio::time::timeout(call_timeout, next_line(&mut lines))
            .await
            .map_err(|_| DomainError::ChatUnavailable("no ServerQuery welcome".into()))??;
        debug!(welcome = %welcome, "ServerQuery session opened");

        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(run_session(lines, writer, request_rx, events_tx, keepalive));

        Ok((
            Self {
                requests,
                call_timeout,
            },
            events,
        ))
    }

    /// Send one command and wait for its reply, bounded by the call timeout.
    pub async fn execute(&self, command: &Command) -> Result<Reply, DomainError> {
        let (tx, rx) = oneshot::channel();
        let request = Request {
            line: command.as_line().to_string(),
            reply: Some(tx),
        };
        let exchange = async {
            self.requests.send(request).await.map_err(|_| closed())?;
            rx.await.map_err(|_| closed())
        };
        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::ChatUnavailable(format!(
                "{} timed out after {}ms",
                command.name(),
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// `execute` followed by `Reply::into_records`.
    pub async fn records(&self, command: &Command) -> Result<Vec<Record>, DomainError> {
        self.execute(command).await?.into_records(command.name())
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// Next non-empty line. Lines end with "\n\r", so the '\r' shows up at the start of the next one.
async fn next_line<R>(lines: &mut Lines<BufReader<R>>) -> Result<String, DomainError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_matches('\r');
                if !line.is_empty() {
                    return Ok(line.to_string());
                }
            }
            Ok(None) => return Err(closed()),
            Err(e) => return Err(DomainError::ChatUnavailable(e.to_string())),
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn run_session<R, W>(
    mut lines: Lines<BufReader<R>>,
    mut writer: W,
    mut requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedSender<Notification>,
    keepalive: Duration,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut in_flight: Option<InFlight> = None;

    loop {
        tokio::select! {
            line = next_line(&mut lines) => {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(error = %e, "ServerQuery session ended");
                        break;
                    }
                };
                if let Some(event) = Notification::parse(&line) {
                    trace!(event = %event.event, "ServerQuery event");
                    let _ = events.send(event);
                    continue;
                }
                let Some(current) = in_flight.as_mut() else {
                    debug!(line = %line, "unsolicited ServerQuery line");
                    continue;
                };
                match QueryStatus::parse(&line) {
                    Some(status) => {
                        if let Some(done) = in_flight.take() {
                            if let Some(reply) = done.reply {
                                let _ = reply.send(Reply { status, records: done.records });
                            }
                        }
                    }
                    None => current.records.extend(parse_records(&line)),
                }
            }
            request = requests.recv(), if in_flight.is_none() => {
                let Some(request) = request else {
                    let _ = write_line(&mut writer, "quit").await;
                    break;
                };
                if let Err(e) = write_line(&mut writer, &request.line).await {
                    warn!(error = %e, "ServerQuery write failed");
                    break;
                }
                in_flight = Some(InFlight { reply: request.reply, records: Vec::new() });
                ticker.reset();
            }
            _ = ticker.tick(), if in_flight.is_none() => {
                if let Err(e) = write_line(&mut writer, "whoami").await {
                    warn!(error = %e, "ServerQuery keepalive failed");
                    break;
                }
                in_flight = Some(InFlight { reply: None, records: Vec::new() });
            }
        }
    }
}
