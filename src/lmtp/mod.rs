//! Minimal LMTP listener.
//!
//! Each accepted connection gets its own [`Session`]. Commands are answered
//! in order, which is all PIPELINING requires of a server. During DATA the
//! dot-unstuffed body is streamed to the session through an in-memory pipe,
//! and once it completes one reply per accepted recipient is written back.

pub mod command;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use self::command::{Command, parse_command};
use crate::error::{EnvelopeError, RecipientError, SessionError};
use crate::responder::{RecipientStatus, Responder};
use crate::session::{Session, SessionState};

/// Longest line read in one piece. Longer DATA lines are passed through in
/// chunks; longer command lines close the connection.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Size of the in-memory pipe between the socket and the message parser.
const DATA_PIPE_BYTES: usize = 16 * 1024;

/// How long live sessions get to finish once shutdown begins.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// LMTP listener bound to a socket.
pub struct LmtpServer {
    listener: TcpListener,
    domain: String,
    responder: Responder,
    read_timeout: Duration,
}

impl LmtpServer {
    pub async fn bind(
        addr: SocketAddr,
        domain: impl Into<String>,
        responder: Responder,
        read_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            domain: domain.into(),
            responder,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to `true`, then give live
    /// sessions [`SHUTDOWN_GRACE`] to finish before aborting them.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), domain = %self.domain, "LMTP listener started");
        let mut sessions = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection::new(
                            stream,
                            peer,
                            Session::new(self.domain.clone(), self.responder.clone()),
                            self.read_timeout,
                        );
                        let domain = self.domain.clone();
                        sessions.spawn(async move {
                            match conn.run(&domain).await {
                                Ok(()) => debug!(peer = %peer, "LMTP connection closed"),
                                Err(e) => warn!(peer = %peer, error = %e, "LMTP connection failed"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept LMTP connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "LMTP session task ended abnormally");
                    }
                }
            }
        }

        drop(self.listener);
        if !sessions.is_empty() {
            info!(active = sessions.len(), "Waiting for LMTP sessions to finish");
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(active = sessions.len(), "Aborting LMTP sessions after grace period");
                sessions.shutdown().await;
            }
        }
        info!("LMTP listener stopped");
    }
}

/// Spawn the listener for the lifetime of the process.
pub fn spawn_lmtp_server(server: LmtpServer, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(server.serve(shutdown))
}

// ── Connection ──────────────────────────────────────────────────────

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    session: Session,
    read_timeout: Duration,
    greeted: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, session: Session, read_timeout: Duration) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            peer,
            session,
            read_timeout,
            greeted: false,
        }
    }

    async fn run(mut self, domain: &str) -> io::Result<()> {
        debug!(peer = %self.peer, "LMTP connection accepted");
        self.respond(&format!("220 {domain} LMTP vacationd ready\r\n"))
            .await?;

        let mut line = Vec::new();
        loop {
            line.clear();
            if read_bounded(&mut self.reader, &mut line, self.read_timeout).await? == 0 {
                debug!(peer = %self.peer, "Client closed connection without QUIT");
                return Ok(());
            }
            if !line.ends_with(b"\n") {
                self.respond("500 5.5.2 Line too long\r\n").await?;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "command line too long",
                ));
            }

            let text = String::from_utf8_lossy(&line);
            trace!(peer = %self.peer, "C: {}", text.trim_end());

            let response = match parse_command(&text) {
                Command::Lhlo(client) => {
                    debug!(peer = %self.peer, client = %client, "LHLO");
                    self.greeted = true;
                    self.session.reset();
                    format!(
                        "250-{domain}\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n250 8BITMIME\r\n"
                    )
                }
                Command::Helo(_) => "500 5.5.1 This is LMTP, use LHLO\r\n".to_string(),
                Command::Mail {
                    address,
                    parameters,
                } if self.greeted => {
                    if !parameters.is_empty() {
                        debug!(peer = %self.peer, ?parameters, "Ignoring MAIL parameters");
                    }
                    match self.session.set_sender(&address) {
                        Ok(()) => "250 2.1.0 Sender OK\r\n".to_string(),
                        Err(e) => envelope_response(&e),
                    }
                }
                Command::Rcpt {
                    address,
                    parameters,
                } if self.greeted => {
                    if !parameters.is_empty() {
                        debug!(peer = %self.peer, ?parameters, "Ignoring RCPT parameters");
                    }
                    match self.session.add_recipient(&address) {
                        Ok(_) => "250 2.1.5 Recipient OK\r\n".to_string(),
                        Err(e) => envelope_response(&e),
                    }
                }
                Command::Mail { .. } | Command::Rcpt { .. } => {
                    "503 5.5.1 Send LHLO first\r\n".to_string()
                }
                Command::Data => {
                    if self.session.state() != SessionState::HaveRecipients {
                        "503 5.5.1 Need RCPT before DATA\r\n".to_string()
                    } else {
                        self.respond("354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                            .await?;
                        self.receive_data().await?
                    }
                }
                Command::Rset => {
                    self.session.reset();
                    "250 2.0.0 OK\r\n".to_string()
                }
                Command::Noop => "250 2.0.0 OK\r\n".to_string(),
                Command::Vrfy(_) => "252 2.5.0 Cannot VRFY user\r\n".to_string(),
                Command::Quit => {
                    self.respond("221 2.0.0 Bye\r\n").await?;
                    return Ok(());
                }
                Command::Syntax(_) => "501 5.5.4 Syntax error in parameters\r\n".to_string(),
                Command::Unknown(_) => "500 5.5.2 Command not recognized\r\n".to_string(),
            };

            self.respond(&response).await?;
        }
    }

    /// Stream the message body into the session and build the per-recipient
    /// replies. The session is only driven to completion if the whole body
    /// arrived; a broken connection abandons the transaction.
    async fn receive_data(&mut self) -> io::Result<String> {
        let tags: Vec<String> = self
            .session
            .recipients()
            .iter()
            .map(|r| r.tag.clone())
            .collect();
        debug!(
            peer = %self.peer,
            sender = %self.session.sender(),
            recipients = tags.len(),
            "Receiving message"
        );
        let (pipe_in, pipe_out) = tokio::io::duplex(DATA_PIPE_BYTES);

        let pump = pump_data(&mut self.reader, pipe_in, self.read_timeout);
        let processing = self.session.data_end(pipe_out);
        tokio::pin!(pump, processing);

        let mut processed = None;
        loop {
            tokio::select! {
                pumped = &mut pump => {
                    pumped?;
                    break;
                }
                result = &mut processing, if processed.is_none() => processed = Some(result),
            }
        }
        let result = match processed {
            Some(result) => result,
            None => processing.await,
        };

        Ok(match result {
            Ok(statuses) => statuses
                .iter()
                .map(|(tag, status)| recipient_response(tag, status))
                .collect(),
            Err(SessionError::Message(e)) => {
                warn!(peer = %self.peer, error = %e, "Rejecting unparseable message");
                tags.iter()
                    .map(|tag| format!("554 5.6.0 <{tag}> Malformed message\r\n"))
                    .collect()
            }
            Err(SessionError::Envelope(e)) => envelope_response(&e),
        })
    }

    async fn respond(&mut self, response: &str) -> io::Result<()> {
        trace!(peer = %self.peer, "S: {}", response.trim_end());
        self.writer.write_all(response.as_bytes()).await
    }
}

fn envelope_response(err: &EnvelopeError) -> String {
    match err {
        EnvelopeError::InvalidSender => format!("553 5.1.7 {err}\r\n"),
        EnvelopeError::InvalidRecipient => format!("550 5.1.1 {err}\r\n"),
        EnvelopeError::WrongDomain { .. } => format!("550 5.1.2 {err}\r\n"),
        EnvelopeError::BadSequence(_) => format!("503 5.5.1 {err}\r\n"),
    }
}

fn recipient_response(tag: &str, status: &RecipientStatus) -> String {
    match status {
        Ok(_) => format!("250 2.0.0 <{tag}> OK\r\n"),
        Err(RecipientError::Timeout(_)) => {
            format!("451 4.4.7 <{tag}> Processing deadline exceeded\r\n")
        }
        Err(_) => format!("451 4.3.0 <{tag}> Auto-reply failed\r\n"),
    }
}

/// Read up to one line, at most [`MAX_LINE_BYTES`], within `timeout`.
async fn read_bounded<R>(reader: &mut R, line: &mut Vec<u8>, timeout: Duration) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(
        timeout,
        reader.take(MAX_LINE_BYTES).read_until(b'\n', line),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
}

/// Copy a DATA body from `reader` into `pipe` up to the terminating dot,
/// removing dot-stuffing. Keeps reading to the terminator even if the other
/// end of the pipe has gone away.
async fn pump_data<R, W>(reader: &mut R, mut pipe: W, timeout: Duration) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut at_line_start = true;
    let mut pipe_open = true;

    loop {
        line.clear();
        if read_bounded(reader, &mut line, timeout).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }

        let mut chunk = line.as_slice();
        if at_line_start {
            if chunk == b".\r\n" || chunk == b".\n" {
                return Ok(());
            }
            if chunk.first() == Some(&b'.') {
                chunk = &chunk[1..];
            }
        }
        at_line_start = line.ends_with(b"\n");

        if pipe_open && pipe.write_all(chunk).await.is_err() {
            pipe_open = false;
        }
    }
}
