//! Accepts inbound connections and hands them to a worker group.
//!
//! One listening socket, installed on a (typically single-worker) boss
//! group. Each readiness event triggers a bounded accept batch; every
//! accepted socket gets a fresh pipeline and is queued onto a worker
//! picked round-robin from the target group.

use crate::pipeline::PipelineFactory;
use crate::reactor::{Connection, EventLoopGroup, Poller, Task, LISTENER_TOKEN};
use mio::net::TcpListener;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: PipelineFactory,
    target: Arc<EventLoopGroup>,
    accept_batch: usize,
}

impl Acceptor {
    /// Bind the listening socket. This blocks until the OS confirms the
    /// socket is listening; failure (port in use, permission denied) is
    /// returned synchronously and is fatal to startup.
    pub fn bind(
        addr: SocketAddr,
        backlog: u32,
        factory: PipelineFactory,
        target: Arc<EventLoopGroup>,
        accept_batch: usize,
    ) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;

        Ok(Self {
            listener: TcpListener::from_std(std_listener),
            local_addr,
            factory,
            target,
            accept_batch: accept_batch.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    pub(crate) fn register(&mut self, poller: &Poller, token: Token) -> io::Result<()> {
        poller.register(&mut self.listener, token, Interest::READABLE)
    }

    /// Accept until the socket would block, bounded by `accept_batch` so
    /// a connect storm cannot starve other sockets on this worker. If the
    /// bound is hit, the listener is re-armed so still-pending
    /// connections surface on the next poll.
    pub(crate) fn on_acceptable(&mut self, poller: &Poller) {
        let mut accepted = 0;
        while accepted < self.accept_batch {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    self.hand_off(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
        }

        if let Err(e) = poller.reregister(&mut self.listener, LISTENER_TOKEN, Interest::READABLE) {
            error!(error = %e, "failed to re-arm listener");
        }
    }

    fn hand_off(&self, stream: mio::net::TcpStream, peer: SocketAddr) {
        let pipeline = match self.factory.build() {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(peer = %peer, error = %e, "failed to build pipeline");
                return;
            }
        };

        let worker = self.target.next();
        let conn = Connection::new(stream, peer, pipeline);
        match worker.submit(Task::Register(conn)) {
            Ok(()) => debug!(peer = %peer, worker = worker.id(), "connection handed off"),
            Err(e) => warn!(peer = %peer, error = %e, "failed to hand off connection"),
        }
    }
}
