//! Post-handshake authentication exchange
//!
//! Newline-terminated JSON, one message per line:
//!
//! ```text
//! responder -> {"auth":"ok"}                          (gate open, done)
//! responder -> {"auth":"required"}                    (gate closed)
//! initiator -> {"auth":{"password":"..."}}
//! responder -> {"auth":"ok"} | {"auth":"fail","reason":"..."}
//! ```
//!
//! Lines are read a byte at a time so nothing past the newline is
//! consumed; raw packets follow immediately on the same stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PasswordGate;
use crate::error::{Error, Result};

/// Longest accepted message line
pub const MAX_LINE_LEN: usize = 4096;

/// Initiator credentials message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Fail,
    Required,
}

/// Responder message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub auth: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthReply {
    pub fn ok() -> Self {
        Self { auth: Verdict::Ok, reason: None }
    }

    pub fn required() -> Self {
        Self { auth: Verdict::Required, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            auth: Verdict::Fail,
            reason: Some(reason.into()),
        }
    }
}

/// Read one line, without the terminator. `None` means the peer closed
/// the stream before sending anything.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Error::PeerDisconnected);
        }
        if byte[0] == b'\n' {
            return Ok(Some(line));
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(Error::AuthRejected("authentication message too long".into()));
        }
        line.push(byte[0]);
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Responder side. On rejection the reply is sent and the stream closed.
///
/// `entry_timeout` bounds the wait for the initiator's password line,
/// which may include an operator typing it.
pub async fn respond<S>(stream: &mut S, gate: &PasswordGate, entry_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = match gate {
        PasswordGate::Open => return write_line(stream, &AuthReply::ok()).await,
        PasswordGate::Required(record) => record,
    };

    write_line(stream, &AuthReply::required()).await?;

    let line = match tokio::time::timeout(entry_timeout, read_line(stream)).await {
        Ok(line) => line,
        Err(_) => Err(Error::AuthRejected(format!("no password received within {:?}", entry_timeout))),
    };
    let outcome = match line {
        Ok(Some(line)) => match serde_json::from_slice::<AuthRequest>(&line) {
            Ok(request) if record.verify(&request.auth.password) => Ok(()),
            Ok(_) => Err(Error::AuthRejected("incorrect password".into())),
            Err(e) => Err(Error::AuthRejected(format!("malformed authentication message: {}", e))),
        },
        Ok(None) | Err(Error::PeerDisconnected) => return Err(Error::PeerDisconnected),
        Err(Error::Io(e)) => Err(Error::AuthRejected(format!("I/O error during authentication: {}", e))),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            write_line(stream, &AuthReply::ok()).await?;
            tracing::info!("Peer authenticated");
            Ok(())
        }
        Err(e) => {
            let reason = match &e {
                Error::AuthRejected(reason) => reason.clone(),
                other => other.to_string(),
            };
            tracing::warn!("Authentication failed: {}", reason);
            let _ = write_line(stream, &AuthReply::fail(reason)).await;
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

/// Initiator side, first step: read the responder's opening message.
/// Returns `true` when a password must be sent with [`answer`].
pub async fn challenge<S>(stream: &mut S) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    match read_reply(stream).await? {
        AuthReply { auth: Verdict::Ok, .. } => Ok(false),
        AuthReply { auth: Verdict::Required, .. } => Ok(true),
        AuthReply { auth: Verdict::Fail, reason } => {
            Err(Error::AuthRejected(reason.unwrap_or_else(|| "rejected".into())))
        }
    }
}

/// Initiator side, second step: send the password and read the verdict
pub async fn answer<S>(stream: &mut S, password: Option<String>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(password) = password else {
        let _ = stream.shutdown().await;
        return Err(Error::AuthRejected("responder requires a password and none was supplied".into()));
    };
    write_line(stream, &AuthRequest { auth: Credentials { password } }).await?;

    match read_reply(stream).await? {
        AuthReply { auth: Verdict::Ok, .. } => Ok(()),
        AuthReply { auth: Verdict::Fail, reason } => {
            Err(Error::AuthRejected(reason.unwrap_or_else(|| "rejected".into())))
        }
        AuthReply { auth: Verdict::Required, .. } => {
            Err(Error::AuthRejected("responder repeated its password prompt".into()))
        }
    }
}

async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> Result<AuthReply> {
    let line = read_line(stream).await?.ok_or(Error::PeerDisconnected)?;
    serde_json::from_slice(&line)
        .map_err(|e| Error::AuthRejected(format!("malformed reply from responder: {}", e)))
}
