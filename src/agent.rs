//! Client for a local key agent.

// ref: https://tools.ietf.org/html/draft-miller-ssh-agent-04

use crate::{
    auth2::{AgentIdentity, KeyAgent},
    consts,
    error::Error,
    wire,
};
use std::{
    env, io,
    path::{Path, PathBuf},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::UnixStream,
};

const SSH_AGENT_PATH_ENV_NAME: &str = "SSH_AUTH_SOCK";

/// Hard bound on an agent reply; a local agent has no business sending
/// more than this.
const MAX_AGENT_REPLY: usize = 256 * 1024;

/// A connection to a key agent speaking the agent protocol over a
/// length-framed byte stream.
pub struct Agent<T> {
    stream: T,
}

impl Agent<UnixStream> {
    /// Connects to the agent named by `SSH_AUTH_SOCK`.
    pub async fn connect() -> io::Result<Self> {
        let agent_path = env::var_os(SSH_AGENT_PATH_ENV_NAME)
            .map(PathBuf::from)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("missing environment variable: {}", SSH_AGENT_PATH_ENV_NAME),
                )
            })?;
        Self::connect_to(agent_path).await
    }

    pub async fn connect_to(agent_path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(agent_path).await?;
        Ok(Self::new(stream))
    }
}

impl<T> Agent<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    async fn roundtrip(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let mut framed = Vec::with_capacity(4 + message.len());
        framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
        framed.extend_from_slice(message);
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;

        let len = self.stream.read_u32().await? as usize;
        if len == 0 || len > MAX_AGENT_REPLY {
            return Err(Error::Local(format!("bad agent reply length {}", len)));
        }
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply[..]).await?;
        Ok(reply)
    }
}

impl<T> KeyAgent for Agent<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn list_identities(&mut self) -> Result<Vec<AgentIdentity>, Error> {
        let reply = self
            .roundtrip(&[consts::SSH_AGENTC_REQUEST_IDENTITIES])
            .await?;
        let mut b = &reply[..];
        let msg_type = wire::get_u8(&mut b)?;
        if msg_type != consts::SSH_AGENT_IDENTITIES_ANSWER {
            return Err(Error::Local(format!(
                "unexpected agent response: type {}",
                msg_type
            )));
        }
        let nkeys = wire::get_u32(&mut b)?;
        tracing::debug!("agent holds {} keys", nkeys);
        let mut identities = vec![];
        for _ in 0..nkeys {
            let key_blob = wire::get_string(&mut b)?;
            let comment = String::from_utf8_lossy(&wire::get_string(&mut b)?).into_owned();
            identities.push(AgentIdentity { key_blob, comment });
        }
        Ok(identities)
    }

    async fn sign(&mut self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut message = vec![consts::SSH_AGENTC_SIGN_REQUEST];
        wire::put_string(&mut message, key_blob);
        wire::put_string(&mut message, data);
        message.extend_from_slice(&0u32.to_be_bytes()); // flags

        let reply = self.roundtrip(&message).await?;
        let mut b = &reply[..];
        let msg_type = wire::get_u8(&mut b)?;
        if msg_type != consts::SSH_AGENT_SIGN_RESPONSE {
            return Err(Error::Local(format!(
                "agent refused to sign: type {}",
                msg_type
            )));
        }
        wire::get_string(&mut b)
    }
}
