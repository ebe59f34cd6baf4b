//! Where request buffers come from and where replies go.

use crate::codec::{SgList, HEADER_SIZE};
use crate::server::ServerError;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One transport buffer: the request as sent by the client and room for the reply.
#[derive(Debug, Default)]
pub struct Element {
    pub out_sg: SgList,
    pub in_sg: SgList,
}

#[async_trait(?Send)]
pub trait TransportReceiver {
    /// Waits for the next request.  `None` means the client has gone away.
    async fn receive(&mut self) -> Result<Option<Element>, ServerError>;
}

#[async_trait(?Send)]
pub trait TransportSender {
    /// Hands back a buffer whose first `len` bytes of `in_sg` hold the reply.
    async fn send(&mut self, element: Element, len: usize) -> Result<(), ServerError>;

    /// Tells the client that replies are available.
    async fn notify(&mut self) -> Result<(), ServerError>;
}

/// The size of the segments stream buffers are split into.
pub const SEGMENT_SIZE: usize = 4096;

/// Reads size-prefixed 9P messages from a byte stream.
pub struct StreamReceiver<R> {
    rd: R,
    msize: usize,
}

/// Writes replies to a byte stream.
pub struct StreamSender<W> {
    wr: W,
}

/// Frames 9P over a pair of byte streams, accepting messages of up to `msize` bytes.
pub fn stream_transport<R, W>(rd: R, wr: W, msize: u32) -> (StreamReceiver<R>, StreamSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (
        StreamReceiver {
            rd,
            msize: msize as usize,
        },
        StreamSender { wr },
    )
}

#[async_trait(?Send)]
impl<R: AsyncRead + Unpin> TransportReceiver for StreamReceiver<R> {
    async fn receive(&mut self) -> Result<Option<Element>, ServerError> {
        let mut hdr = [0u8; HEADER_SIZE];
        match self.rd.read(&mut hdr).await? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                self.rd.read_exact(&mut hdr[n..]).await?;
            }
            _ => (),
        }
        let size = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        if (size as usize) < HEADER_SIZE || size as usize > self.msize {
            return Err(ServerError::InvalidSize(size));
        }
        let mut data = vec![0u8; size as usize];
        data[..HEADER_SIZE].copy_from_slice(&hdr);
        self.rd.read_exact(&mut data[HEADER_SIZE..]).await?;
        Ok(Some(Element {
            out_sg: SgList::from_bytes(&data, SEGMENT_SIZE),
            in_sg: SgList::zeroed(self.msize, SEGMENT_SIZE),
        }))
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite + Unpin> TransportSender for StreamSender<W> {
    async fn send(&mut self, element: Element, len: usize) -> Result<(), ServerError> {
        if len > element.in_sg.len() {
            return Err(
                io::Error::new(io::ErrorKind::InvalidInput, "reply overruns its buffer").into(),
            );
        }
        for chunk in element.in_sg.slices(0, len) {
            self.wr.write_all(chunk).await?;
        }
        Ok(())
    }

    async fn notify(&mut self) -> Result<(), ServerError> {
        self.wr.flush().await?;
        Ok(())
    }
}
