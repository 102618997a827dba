//! Per-connection state: the socket, its pipeline, and pending outbound
//! bytes. Owned and mutated exclusively by one worker thread.

use crate::pipeline::Pipeline;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

pub struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    /// Interest set currently registered with the poller.
    pub(crate) interest: Interest,
    pipeline: Pipeline,
    /// Wire bytes the socket has not taken yet. Flushed on writable
    /// readiness; never dropped or reordered.
    outbound: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, pipeline: Pipeline) -> Self {
        Self {
            stream,
            peer,
            interest: Interest::READABLE,
            pipeline,
            outbound: BytesMut::new(),
        }
    }

    /// Fire the pipeline's active event and flush whatever it produced.
    pub fn fire_active(&mut self) -> io::Result<()> {
        self.pipeline.fire_active(&mut self.outbound)?;
        self.flush()
    }

    pub fn fire_inactive(&mut self) {
        self.pipeline.fire_inactive();
    }

    pub fn fire_error(&mut self, error: &io::Error) {
        self.pipeline.fire_error(error);
    }

    /// Drain the socket into `scratch`, feeding each chunk through the
    /// pipeline. Returns Ok(false) once the peer has closed its end; any
    /// echo of the final bytes is flushed best-effort first.
    pub fn on_readable(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    self.flush()?;
                    return Ok(false);
                }
                Ok(n) => {
                    self.pipeline
                        .fire_inbound(&scratch[..n], &mut self.outbound)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.flush()?;
        Ok(true)
    }

    pub fn on_writable(&mut self) -> io::Result<bool> {
        self.flush()?;
        Ok(true)
    }

    /// Write pending outbound bytes until the socket would block.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// True while bytes are pending; the worker then keeps WRITABLE in
    /// the interest set.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }
}
