//! [`Transport`] adapter for Tokio byte streams.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};

use super::{Transport, TransportError, TransportKind};

const READ_CHUNK: usize = 4096;

/// Wraps any `AsyncRead + AsyncWrite` stream, such as a serial port opened
/// by the host application, a TCP bridge or a `tokio::io::duplex` pipe.
///
/// Reads poll the stream once and never wait; an end-of-stream read is
/// reported as [`TransportError::Disconnected`].
pub struct StreamTransport<S> {
    kind: TransportKind,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split `stream` into independently locked halves.
    pub fn new(stream: S, kind: TransportKind) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            kind,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn kind(&self) -> TransportKind { self.kind }

    async fn close(&self) -> Result<(), TransportError> {
        match self.writer.lock().await.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_available(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match reader.read_buf(&mut buf).now_or_never() {
            None => Ok(None),
            Some(Ok(0)) => Err(TransportError::Disconnected),
            Some(Ok(_)) => Ok(Some(buf.freeze())),
            Some(Err(e)) => Err(e.into()),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}
