use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_util::{ready, FutureExt, Stream};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    pin,
};

use crate::chunker::Chunker;

const REFILL_SIZE: usize = 1024 * 1024;

/// A streaming chunker to use with any source which implements tokio AsyncRead.
pub struct StreamingChunker<C, R> {
    buf: BytesMut,
    chunker: C,
    reader: R,
}

impl<C, R> StreamingChunker<C, R> {
    pub fn new(chunker: C, reader: R) -> Self {
        Self {
            buf: BytesMut::with_capacity(REFILL_SIZE),
            chunker,
            reader,
        }
    }
}

impl<C, R> Stream for StreamingChunker<C, R>
where
    C: Chunker + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    type Item = io::Result<Bytes>;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            let me = &mut *self;
            if !me.buf.is_empty() {
                if let Some(chunk) = me.chunker.next(&mut me.buf) {
                    return Poll::Ready(Some(Ok(chunk)));
                }
            }
            // Append more data to buffer since no chunk was found.
            if me.buf.capacity() < me.buf.len() + REFILL_SIZE {
                me.buf.reserve(REFILL_SIZE);
            }
            let read_f = me.reader.read_buf(&mut me.buf);
            pin!(read_f);
            match ready!(read_f.poll_unpin(cx))? {
                0 => {
                    // End of file/reader.
                    // Return a last chunk if there is data left in buffer.
                    let last_chunk = if me.buf.is_empty() {
                        None
                    } else {
                        Some(Ok(me.buf.split().freeze()))
                    };
                    return Poll::Ready(last_chunk);
                }
                _rc => {}
            }
        }
    }
}
