// src/stream.rs
use crate::context::Context;
use crate::error::Error;
use crate::poller::AsyncFd;
use crate::sync::Mutex;
use crate::task::{spawn, Task};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A buffered asynchronous byte stream over a registered file descriptor.
///
/// Reads accumulate into a growable buffer; on `WouldBlock` the reader
/// suspends on a readiness wait and retries. Writes are serialized FIFO by an
/// internal [`Mutex`]. Cloning shares the descriptor and buffer.
#[derive(Clone)]
pub struct AsyncStream {
    fd: Rc<AsyncFd>,
    buf: Rc<RefCell<Vec<u8>>>,
    write_lock: Mutex,
}

impl AsyncStream {
    pub(crate) fn new(fd: AsyncFd) -> Self {
        Self {
            fd: Rc::new(fd),
            buf: Rc::new(RefCell::new(Vec::new())),
            write_lock: Mutex::new(),
        }
    }

    pub fn close(&self) -> Result<(), Error> {
        self.fd.close()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.buf.borrow().len()
    }

    /// Read once into the buffer, up to `max` buffered bytes in total,
    /// waiting for readiness as needed. Returns true at end of file.
    async fn fill(&self, ctx: &Context, max: usize) -> Result<bool, Error> {
        if self.buf_len() >= max {
            return Ok(false);
        }
        loop {
            let read = {
                let mut buf = self.buf.borrow_mut();
                let len = buf.len();
                buf.resize(max, 0);
                let res = self.fd.read(&mut buf[len..]);
                match &res {
                    Ok(n) => buf.truncate(len + n),
                    Err(_) => buf.truncate(len),
                }
                res
            };
            match read {
                Ok(0) => return Ok(true),
                Ok(_) => return Ok(false),
                Err(Error::WouldBlock) => self.fd.wait_for_ready(ctx).await?,
                Err(err) => return Err(err),
            }
        }
    }

    fn consume(&self, max: usize) -> Vec<u8> {
        let mut buf = self.buf.borrow_mut();
        let n = max.min(buf.len());
        buf.drain(..n).collect()
    }

    fn consume_all(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.borrow_mut())
    }

    /// Bytes up to and including the first `byte`. At end of file residual
    /// bytes are returned as a partial result; end of file with an empty
    /// buffer is [`Error::Eof`].
    pub async fn read_until(&self, ctx: &Context, byte: u8) -> Result<Vec<u8>, Error> {
        let existing = {
            let buf = self.buf.borrow();
            buf.iter().position(|&b| b == byte)
        };
        if let Some(i) = existing {
            return Ok(self.consume(i + 1));
        }

        let mut buf_size = 1024;
        loop {
            let before = self.buf_len();
            let eof = self.fill(ctx, buf_size).await?;
            let found = {
                let buf = self.buf.borrow();
                buf[before..].iter().position(|&b| b == byte).map(|i| before + i)
            };
            if let Some(i) = found {
                return Ok(self.consume(i + 1));
            }
            if eof {
                if self.buf_len() > 0 {
                    return Ok(self.consume_all());
                }
                return Err(Error::Eof);
            }
            if self.buf_len() >= buf_size {
                buf_size *= 2;
            }
        }
    }

    pub async fn read_line(&self, ctx: &Context) -> Result<Vec<u8>, Error> {
        self.read_until(ctx, b'\n').await
    }

    /// Exactly `chunk_size` bytes, or fewer if end of file truncates; end of
    /// file with nothing buffered is [`Error::Eof`].
    pub async fn read_chunk(&self, ctx: &Context, chunk_size: usize) -> Result<Vec<u8>, Error> {
        let mut eof = false;
        while !eof && self.buf_len() < chunk_size {
            eof = self.fill(ctx, chunk_size).await?;
        }
        if !eof || self.buf_len() > 0 {
            return Ok(self.consume(chunk_size));
        }
        Err(Error::Eof)
    }

    /// Everything until end of file.
    pub async fn read_all(&self, ctx: &Context) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut stream = self.stream(ctx, 1024);
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Write all of `data`, as a task. Concurrent writers are serialized in
    /// lock-acquisition order.
    pub fn write(&self, ctx: &Context, data: Vec<u8>) -> Task<usize> {
        let stream = self.clone();
        spawn(ctx, move |ctx| async move {
            stream.write_lock.lock(&ctx).await?;
            let res = stream.write_locked(&ctx, &data).await;
            stream.write_lock.unlock();
            res
        })
    }

    async fn write_locked(&self, ctx: &Context, mut data: &[u8]) -> Result<usize, Error> {
        let mut written = 0;
        while !data.is_empty() {
            match self.fd.write(data) {
                Ok(n) => {
                    written += n;
                    data = &data[n..];
                }
                Err(Error::WouldBlock) => self.fd.wait_for_ready(ctx).await?,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    /// Raw chunks as they arrive, at most `buf_size` bytes each.
    pub fn stream(&self, ctx: &Context, buf_size: usize) -> ByteStream {
        ByteStream {
            stream: self.clone(),
            ctx: ctx.clone(),
            buf_size,
            done: false,
        }
    }

    /// Chunks of up to `chunk_size` bytes; the final chunk may be shorter.
    pub fn chunks(&self, ctx: &Context, chunk_size: usize) -> Chunks {
        Chunks {
            stream: self.clone(),
            ctx: ctx.clone(),
            chunk_size,
            done: false,
        }
    }

    /// Buffered slices terminated by `\n`; a final unterminated line is
    /// yielded at end of file.
    pub fn lines(&self, ctx: &Context) -> Lines {
        Lines {
            stream: self.clone(),
            ctx: ctx.clone(),
            buf_size: 1024,
            scanned: 0,
            queued: VecDeque::new(),
            done: false,
        }
    }
}

pub struct ByteStream {
    stream: AsyncStream,
    ctx: Context,
    buf_size: usize,
    done: bool,
}

impl ByteStream {
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, Error>> {
        while !self.done {
            match self.stream.fill(&self.ctx, self.buf_size).await {
                Ok(eof) => {
                    if eof {
                        self.done = true;
                    }
                    let chunk = self.stream.consume_all();
                    if !chunk.is_empty() {
                        return Some(Ok(chunk));
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

pub struct Chunks {
    stream: AsyncStream,
    ctx: Context,
    chunk_size: usize,
    done: bool,
}

impl Chunks {
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, Error>> {
        if self.done {
            return None;
        }
        loop {
            if self.stream.buf_len() >= self.chunk_size {
                return Some(Ok(self.stream.consume(self.chunk_size)));
            }
            match self.stream.fill(&self.ctx, self.chunk_size).await {
                Ok(false) => {}
                Ok(true) => {
                    self.done = true;
                    if self.stream.buf_len() == 0 {
                        return None;
                    }
                    return Some(Ok(self.stream.consume(self.chunk_size)));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

pub struct Lines {
    stream: AsyncStream,
    ctx: Context,
    buf_size: usize,
    // Buffer prefix already scanned for newlines.
    scanned: usize,
    queued: VecDeque<Vec<u8>>,
    done: bool,
}

impl Lines {
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, Error>> {
        loop {
            if let Some(line) = self.queued.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.stream.fill(&self.ctx, self.buf_size).await {
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Ok(true) => {
                    self.done = true;
                    let rest = self.stream.consume_all();
                    if !rest.is_empty() {
                        self.queued = split_lines(&rest).into();
                    }
                }
                Ok(false) => {
                    let found = {
                        let buf = self.stream.buf.borrow();
                        buf[self.scanned..]
                            .iter()
                            .rposition(|&b| b == b'\n')
                            .map(|i| self.scanned + i)
                    };
                    if let Some(i) = found {
                        let data = self.stream.consume(i + 1);
                        self.queued = split_lines(&data).into();
                    }
                    self.scanned = self.stream.buf_len();
                    if self.scanned >= self.buf_size {
                        self.buf_size *= 2;
                    }
                }
            }
        }
    }
}

fn split_lines(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' || i == data.len() - 1 {
            out.push(data[start..=i].to_vec());
            start = i + 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lines_keeps_terminators() {
        let lines = split_lines(b"a\nbb\nccc\n");
        assert_eq!(lines, vec![b"a\n".to_vec(), b"bb\n".to_vec(), b"ccc\n".to_vec()]);
    }

    #[test]
    fn split_lines_yields_trailing_partial_line() {
        let lines = split_lines(b"one\ntwo");
        assert_eq!(lines, vec![b"one\n".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn split_lines_on_empty_input() {
        assert!(split_lines(b"").is_empty());
    }
}
