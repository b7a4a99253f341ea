//! Line reader for TNC monitor output and APRS-IS.
//!
//! Both send `\r\n` terminated lines, but serial TNCs are sloppy about it. We
//! split at either `\r` or `\n` and ignore the resulting empty lines.

use std::{
    pin::Pin,
    string::FromUtf8Error,
    task::{
        Context,
        Poll,
    },
};

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

/// APRS-IS limits lines to 512 bytes. Serial monitors add a prefix, and the
/// legacy image frames are long, so we leave some room.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("line exceeds {max_length} bytes")]
    MaxLineLengthExceeded { max_length: usize },
    #[error("line is not valid utf-8")]
    InvalidEncoding(#[from] FromUtf8Error),
}

impl Error {
    /// Whether the reader can't continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pin_project! {
    #[derive(Debug)]
    pub struct LineReader<R> {
        #[pin]
        reader: R,
        receive_buffer: ReceiveBuffer,
    }
}

impl<R: AsyncRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(reader: R, max_line_length: usize) -> Self {
        Self {
            reader,
            receive_buffer: ReceiveBuffer::new(max_line_length),
        }
    }
}

impl<R: AsyncRead> Stream for LineReader<R> {
    type Item = Result<String, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(line) = this.receive_buffer.next_line() {
                if let Some(line) = line {
                    return Poll::Ready(Some(String::from_utf8(line).map_err(Into::into)));
                }
            }
            else if this.receive_buffer.eof {
                return Poll::Ready(
                    this.receive_buffer
                        .take_remainder()
                        .map(|line| String::from_utf8(line).map_err(Into::into)),
                );
            }
            else if this.receive_buffer.is_full() {
                let max_length = this.receive_buffer.buffer.len();
                this.receive_buffer.discard();
                return Poll::Ready(Some(Err(Error::MaxLineLengthExceeded { max_length })));
            }
            else {
                this.receive_buffer.prepare_read();
                let mut read_buf =
                    ReadBuf::new(&mut this.receive_buffer.buffer[this.receive_buffer.write_pos..]);
                match this.reader.poll_read(cx, &mut read_buf) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                    Poll::Ready(Ok(())) => {
                        let num_bytes_read = read_buf.filled().len();
                        if num_bytes_read == 0 {
                            this.receive_buffer.eof = true;
                        }

                        this.receive_buffer.write_pos += num_bytes_read;
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct ReceiveBuffer {
    buffer: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    no_newline_until: usize,
    /// Drop everything up to the next newline, it's the tail of an over-long
    /// line.
    discarding: bool,
    eof: bool,
}

impl ReceiveBuffer {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0; size].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            no_newline_until: 0,
            discarding: false,
            eof: false,
        }
    }

    fn scan_for_newline(&mut self) -> Option<usize> {
        if let Some(index) = self.buffer[self.no_newline_until..self.write_pos]
            .iter()
            .position(|byte| *byte == b'\r' || *byte == b'\n')
        {
            let index = index + self.no_newline_until;
            self.no_newline_until = index;
            Some(index)
        }
        else {
            self.no_newline_until = self.write_pos;
            None
        }
    }

    /// `Some(None)` if a line was consumed but should be skipped.
    fn next_line(&mut self) -> Option<Option<Vec<u8>>> {
        let newline = self.scan_for_newline()?;
        let start = self.read_pos;
        self.read_pos = newline + 1;
        self.no_newline_until = self.read_pos;

        if std::mem::take(&mut self.discarding) || start == newline {
            Some(None)
        }
        else {
            Some(Some(self.buffer[start..newline].to_vec()))
        }
    }

    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        let remainder = (self.read_pos < self.write_pos && !self.discarding)
            .then(|| self.buffer[self.read_pos..self.write_pos].to_vec());
        self.read_pos = self.write_pos;
        self.no_newline_until = self.write_pos;
        remainder
    }

    fn is_full(&self) -> bool {
        self.read_pos == 0 && self.write_pos == self.buffer.len()
    }

    fn discard(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.no_newline_until = 0;
        self.discarding = true;
    }

    fn prepare_read(&mut self) {
        if self.read_pos > 0 {
            // move data
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.no_newline_until -= self.read_pos;
            self.read_pos = 0;
        }
    }
}
