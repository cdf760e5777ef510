//! Response recording.
//!
//! [`ResponseWriter`] is the outbound write surface: headers, a write-once
//! status, body bytes. Optional capabilities (flush, connection takeover,
//! server push) are discovered at runtime through the `as_*` queries rather
//! than assumed.
//!
//! [`ResponseRecorder`] decorates any writer, captures the status and byte
//! count into a [`ResponseRecord`], and offers exactly the capabilities of the
//! writer it wraps.

use std::io;

use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

/// A raw, bidirectional client connection taken over from the HTTP layer.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub trait Flush {
    fn flush(&mut self) -> io::Result<()>;
}

pub trait Hijack {
    /// Takes the connection away from the HTTP layer.
    fn hijack(&mut self) -> Result<Box<dyn Connection>, Error>;
}

pub trait Push {
    /// Initiates a server push of `target`.
    fn push(&mut self, target: &str) -> Result<(), Error>;
}

pub trait ResponseWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the status. Only the first call counts.
    fn write_header(&mut self, status: StatusCode);

    /// Writes body bytes, implying `200 OK` if no status was set yet.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn as_flush(&mut self) -> Option<&mut dyn Flush> { None }
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> { None }
    fn as_push(&mut self) -> Option<&mut dyn Push> { None }
}

impl<W: ResponseWriter + ?Sized> ResponseWriter for &mut W {
    fn headers_mut(&mut self) -> &mut HeaderMap { (**self).headers_mut() }
    fn write_header(&mut self, status: StatusCode) { (**self).write_header(status) }
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { (**self).write(buf) }
    fn as_flush(&mut self) -> Option<&mut dyn Flush> { (**self).as_flush() }
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> { (**self).as_hijack() }
    fn as_push(&mut self) -> Option<&mut dyn Push> { (**self).as_push() }
}

/// What a [`ResponseRecorder`] has observed so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseRecord {
    /// `200 OK` until a status is written.
    pub status: StatusCode,
    pub bytes: u64,
    pub wrote_header: bool,
}

impl Default for ResponseRecord {
    fn default() -> Self {
        Self { status: StatusCode::OK, bytes: 0, wrote_header: false }
    }
}

pub struct ResponseRecorder<W> {
    inner: W,
    record: ResponseRecord,
}

impl<W: ResponseWriter> ResponseRecorder<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, record: ResponseRecord::default() }
    }

    pub fn record(&self) -> ResponseRecord {
        self.record
    }

    pub fn wrote_header(&self) -> bool {
        self.record.wrote_header
    }

    /// Flushes the wrapped writer. A no-op when it cannot flush.
    pub fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_flush() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }

    pub fn hijack(&mut self) -> Result<Box<dyn Connection>, Error> {
        self.inner.as_hijack().ok_or(Error::Unsupported("hijack"))?.hijack()
    }

    pub fn push(&mut self, target: &str) -> Result<(), Error> {
        self.inner.as_push().ok_or(Error::Unsupported("push"))?.push(target)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: ResponseWriter> ResponseWriter for ResponseRecorder<W> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.record.wrote_header {
            return;
        }
        self.record.status = status;
        self.record.wrote_header = true;
        self.inner.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.record.wrote_header {
            self.write_header(StatusCode::OK);
        }
        let n = self.inner.write(buf)?;
        self.record.bytes += n as u64;
        Ok(n)
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.inner.as_flush().is_some() { Some(self) } else { None }
    }

    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> {
        if self.inner.as_hijack().is_some() { Some(self) } else { None }
    }

    fn as_push(&mut self) -> Option<&mut dyn Push> {
        if self.inner.as_push().is_some() { Some(self) } else { None }
    }
}

impl<W: ResponseWriter> Flush for ResponseRecorder<W> {
    fn flush(&mut self) -> io::Result<()> {
        ResponseRecorder::flush(self)
    }
}

impl<W: ResponseWriter> Hijack for ResponseRecorder<W> {
    fn hijack(&mut self) -> Result<Box<dyn Connection>, Error> {
        ResponseRecorder::hijack(self)
    }
}

impl<W: ResponseWriter> Push for ResponseRecorder<W> {
    fn push(&mut self, target: &str) -> Result<(), Error> {
        ResponseRecorder::push(self, target)
    }
}
