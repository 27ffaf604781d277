//! Transports that carry envelopes between the plugin and the panel.
//!
//! The runtime only needs two halves: something that yields inbound
//! envelopes in arrival order and something that writes outbound ones. A
//! [`Transport`] splits into those halves so the receive loop and the
//! writers never contend on the same object.
//!
//! Two implementations ship with the crate:
//!
//! - [`ChannelTransport`]: in-memory duplex over tokio channels, used by
//!   tests and by hosts embedding the plugin in-process.
//! - [`FrameTransport`]: a 4-byte big-endian length prefix followed by a
//!   JSON-encoded envelope, over any tokio byte stream.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::TransportError;

/// Default upper bound on a single encoded envelope.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Inbound half of a transport.
#[async_trait]
pub trait EnvelopeReader: Send {
    /// Next envelope in arrival order, or `None` at end of stream.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait EnvelopeWriter: Send {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// A duplex envelope stream that can be split into its two halves.
pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn EnvelopeReader>, Box<dyn EnvelopeWriter>);
}

// ---------------------------------------------------------------------------
// In-memory channel transport
// ---------------------------------------------------------------------------

/// Plugin side of an in-memory duplex.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Envelope>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

/// Panel side of an in-memory duplex.
///
/// Dropping it, or calling [`HostEnd::close`], ends the plugin's inbound
/// stream.
pub struct HostEnd {
    to_plugin: Option<mpsc::UnboundedSender<Envelope>>,
    from_plugin: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelTransport {
    /// Create a connected plugin/panel pair.
    pub fn pair() -> (ChannelTransport, HostEnd) {
        let (to_plugin, inbound) = mpsc::unbounded_channel();
        let (outbound, from_plugin) = mpsc::unbounded_channel();
        (ChannelTransport { inbound, outbound }, HostEnd {
            to_plugin: Some(to_plugin),
            from_plugin,
        })
    }
}

impl Transport for ChannelTransport {
    fn split(self) -> (Box<dyn EnvelopeReader>, Box<dyn EnvelopeWriter>) {
        (Box::new(ChannelReader(self.inbound)), Box::new(ChannelWriter(self.outbound)))
    }
}

struct ChannelReader(mpsc::UnboundedReceiver<Envelope>);

#[async_trait]
impl EnvelopeReader for ChannelReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        Ok(self.0.recv().await)
    }
}

struct ChannelWriter(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl EnvelopeWriter for ChannelWriter {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.0.send(envelope.clone()).map_err(|_| TransportError::PeerGone)
    }
}

impl HostEnd {
    /// Deliver an envelope to the plugin.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        match &self.to_plugin {
            Some(tx) => tx.send(envelope).map_err(|_| TransportError::PeerGone),
            None => Err(TransportError::PeerGone),
        }
    }

    /// Next envelope written by the plugin, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.from_plugin.recv().await
    }

    /// End the plugin's inbound stream. Envelopes already written by the
    /// plugin can still be received.
    pub fn close(&mut self) {
        self.to_plugin = None;
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed JSON frames
// ---------------------------------------------------------------------------

/// Frame size limits applied on both read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frame: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Write one envelope as a length-prefixed JSON frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    limits: &FrameLimits,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(envelope)?;
    let max = limits.max_frame.min(u32::MAX as usize);
    if bytes.len() > max {
        return Err(TransportError::FrameTooLarge { size: bytes.len(), max });
    }

    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix and
/// [`TransportError::PeerGone`] when the stream ends inside a frame. A whole
/// frame that is not a valid envelope yields [`TransportError::Malformed`]
/// and leaves the reader positioned at the next frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: &FrameLimits,
) -> Result<Option<Envelope>, TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(len_buf) as usize;
    if size > limits.max_frame {
        return Err(TransportError::FrameTooLarge {
            size,
            max: limits.max_frame,
        });
    }

    let mut payload = vec![0u8; size];
    if let Err(e) = reader.read_exact(&mut payload).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            debug!(expected = size, "stream ended inside a frame");
            return Err(TransportError::PeerGone);
        }
        return Err(e.into());
    }

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(TransportError::Malformed)
}

/// Framed transport over a tokio read half and write half.
pub struct FrameTransport<R, W> {
    reader: R,
    writer: W,
    limits: FrameLimits,
}

impl<R, W> FrameTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_limits(reader, writer, FrameLimits::default())
    }

    pub fn with_limits(reader: R, writer: W, limits: FrameLimits) -> Self {
        Self { reader, writer, limits }
    }

    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }
}

impl FrameTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Open a TCP connection to the panel.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

impl<R, W> Transport for FrameTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn split(self) -> (Box<dyn EnvelopeReader>, Box<dyn EnvelopeWriter>) {
        let reader = FrameReader {
            inner: self.reader,
            limits: self.limits,
        };
        let writer = FrameWriter {
            inner: self.writer,
            limits: self.limits,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct FrameReader<R> {
    inner: R,
    limits: FrameLimits,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EnvelopeReader for FrameReader<R> {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        read_frame(&mut self.inner, &self.limits).await
    }
}

struct FrameWriter<W> {
    inner: W,
    limits: FrameLimits,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EnvelopeWriter for FrameWriter<W> {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        write_frame(&mut self.inner, envelope, &self.limits).await
    }
}
