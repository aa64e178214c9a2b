//! Protocol client: the connection half a front-end needs to talk to the
//! server. Rendering and notifications live elsewhere.

use anyhow::{Result, anyhow};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use parlor_crypto::{FrameCodec, SharedKey, read_frame, write_frame};
use parlor_types::{AuthAction, Envelope, MessageKind};

pub struct Client<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    codec: FrameCodec,
}

impl Client<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A, key: &SharedKey) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, key))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, key: &SharedKey) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            codec: FrameCodec::new(key),
        }
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S
    where
        S: Unpin,
    {
        self.reader.unsplit(self.writer)
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = self.codec.encode(envelope)?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Next envelope from the server, or `None` once the server hangs up.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        match read_frame(&mut self.reader).await? {
            Some(frame) => Ok(Some(self.codec.decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// Receive until `pick` accepts an envelope, discarding the rest.
    pub async fn recv_until<T>(&mut self, mut pick: impl FnMut(Envelope) -> Option<T>) -> Result<T> {
        loop {
            let envelope = self
                .recv()
                .await?
                .ok_or_else(|| anyhow!("server closed the connection"))?;
            if let Some(found) = pick(envelope) {
                return Ok(found);
            }
        }
    }

    /// Register an account. Returns the server's error text on refusal.
    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<std::result::Result<(), String>> {
        self.send(&Envelope::Auth {
            action: AuthAction::Register,
            username: username.to_string(),
            password: password.to_string(),
            email: email.map(str::to_string),
        })
        .await?;

        self.recv_until(|env| match env {
            Envelope::RegisterResult { success: true, .. } => Some(Ok(())),
            Envelope::RegisterResult { error, .. } => Some(Err(error.unwrap_or_default())),
            _ => None,
        })
        .await
    }

    /// Log in. Returns the server's error text on refusal.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<std::result::Result<(), String>> {
        self.send(&Envelope::Auth {
            action: AuthAction::Login,
            username: username.to_string(),
            password: password.to_string(),
            email: None,
        })
        .await?;

        self.recv_until(|env| match env {
            Envelope::AuthResult { success: true, .. } => Some(Ok(())),
            Envelope::AuthResult { error, .. } => Some(Err(error.unwrap_or_default())),
            _ => None,
        })
        .await
    }

    pub async fn join(&mut self, room: &str) -> Result<()> {
        self.send(&Envelope::JoinRoom {
            room: room.to_string(),
        })
        .await
    }

    pub async fn say(&mut self, body: &str, kind: MessageKind) -> Result<()> {
        self.send(&Envelope::Message {
            username: String::new(),
            body: body.to_string(),
            kind,
            room: String::new(),
            timestamp: None,
        })
        .await
    }
}
