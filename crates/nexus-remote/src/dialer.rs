use nexus_types::{AuthKind, ConnectionRecord, DecryptedCredentials};
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected by remote host")]
    AuthFailed,

    #[error("timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

// ── SSH Dialer ───────────────────────────────────────────────────
//
// Opens, authenticates and tears down SSH sessions from a connection
// record plus its decrypted credentials. Session ownership transfers
// to the caller; the caller's exit path closes it.

struct ClientHandler;

#[async_trait::async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all host keys (the operator has explicitly registered
        // the target).
        Ok(true)
    }
}

#[derive(Clone)]
pub struct Dialer {
    ready_timeout: Duration,
    keepalive_interval: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

impl Dialer {
    pub fn new(ready_timeout: Duration, keepalive_interval: Duration) -> Self {
        Self {
            ready_timeout,
            keepalive_interval,
        }
    }

    pub async fn connect(
        &self,
        record: &ConnectionRecord,
        creds: &DecryptedCredentials,
        cancel: &CancellationToken,
    ) -> Result<RemoteSession, DialError> {
        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            ..Default::default()
        });

        let connect = russh::client::connect(
            config,
            (record.host.as_str(), record.port),
            ClientHandler,
        );
        let mut handle = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = tokio::time::timeout(self.ready_timeout, connect) => match result {
                Err(_) => return Err(DialError::Timeout),
                Ok(Err(e)) => return Err(DialError::Unreachable(e.to_string())),
                Ok(Ok(handle)) => handle,
            },
        };

        let authenticated = match record.auth_kind {
            AuthKind::Password => {
                let password = creds.password.as_deref().ok_or(DialError::AuthFailed)?;
                handle
                    .authenticate_password(&record.username, password)
                    .await
                    .map_err(protocol_err)?
            }
            AuthKind::Key => {
                let key = creds.private_key.as_deref().ok_or(DialError::AuthFailed)?;
                let key_pair = russh_keys::decode_secret_key(key, creds.passphrase.as_deref())
                    .map_err(|e| DialError::Protocol(format!("failed to decode private key: {e}")))?;
                handle
                    .authenticate_publickey(&record.username, Arc::new(key_pair))
                    .await
                    .map_err(protocol_err)?
            }
            AuthKind::None => handle
                .authenticate_none(&record.username)
                .await
                .map_err(protocol_err)?,
        };

        if !authenticated {
            return Err(DialError::AuthFailed);
        }

        Ok(RemoteSession { handle })
    }
}

fn protocol_err(err: russh::Error) -> DialError {
    DialError::Protocol(err.to_string())
}

// ── Remote session ───────────────────────────────────────────────

pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Always the final event; carries the remote exit status.
    Exit(u32),
}

pub struct ExecStream {
    rx: mpsc::Receiver<ExecEvent>,
}

impl ExecStream {
    pub async fn next(&mut self) -> Option<ExecEvent> {
        self.rx.recv().await
    }
}

pub struct RemoteSession {
    handle: russh::client::Handle<ClientHandler>,
}

impl RemoteSession {
    /// Execute a command and stream its output. The exit status is
    /// delivered after the channel has drained, so no output is lost.
    pub async fn exec(
        &self,
        command: &str,
        pty: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecStream, DialError> {
        let mut channel = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = self.handle.channel_open_session() => {
                result.map_err(|e| DialError::Protocol(format!("failed to open channel: {e}")))?
            }
        };

        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| DialError::Protocol(format!("failed to request pty: {e}")))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| DialError::Protocol(format!("failed to exec command: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut exit_code: Option<u32> = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        if tx.send(ExecEvent::Stdout(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        if tx.send(ExecEvent::Stderr(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status);
                    }
                    _ => {}
                }
            }
            // 255 mirrors ssh's own "no exit status" convention.
            let _ = tx.send(ExecEvent::Exit(exit_code.unwrap_or(255))).await;
        });

        Ok(ExecStream { rx })
    }

    /// Run a command to completion, buffering output. For the short
    /// administrative commands (probes, mkdir) where streaming is
    /// overkill.
    pub async fn exec_collect(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<(u32, String, String), DialError> {
        let mut stream = self.exec(command, false, cancel).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(DialError::Cancelled),
                event = stream.next() => event,
            };
            match event {
                Some(ExecEvent::Stdout(chunk)) => stdout.extend_from_slice(&chunk),
                Some(ExecEvent::Stderr(chunk)) => stderr.extend_from_slice(&chunk),
                Some(ExecEvent::Exit(code)) => {
                    return Ok((
                        code,
                        String::from_utf8_lossy(&stdout).into_owned(),
                        String::from_utf8_lossy(&stderr).into_owned(),
                    ));
                }
                None => return Err(DialError::Protocol("channel closed unexpectedly".into())),
            }
        }
    }

    /// Open an SFTP channel on this session.
    pub async fn sftp(
        &self,
        cancel: &CancellationToken,
    ) -> Result<russh_sftp::client::SftpSession, DialError> {
        let channel = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = self.handle.channel_open_session() => {
                result.map_err(|e| DialError::Protocol(format!("failed to open channel: {e}")))?
            }
        };
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| DialError::Protocol(format!("failed to request sftp: {e}")))?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DialError::Protocol(format!("failed to start sftp: {e}")))
    }

    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
