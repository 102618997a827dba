//! Readiness multiplexer over mio (epoll on Linux, kqueue on macOS).
//!
//! Thin contract: register sockets with an interest set, block in `poll`
//! until something is ready or the timeout elapses, get back a finite
//! batch of (token, ready-ops). A socket the OS reports as errored shows
//! up with `error` set so the owner can deregister it and move on; poll
//! failures other than EINTR are the worker's to handle.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::time::Duration;

/// Readiness of one socket, copied out of the OS event batch.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// The OS flagged the socket itself as broken (e.g. async connect
    /// failure, invalidated fd). Treated as a per-connection error.
    pub error: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// A waker other threads can use to interrupt `poll`.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    pub fn register<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until at least one socket is ready or the timeout elapses,
    /// filling `ready` with the batch. EINTR is absorbed and yields an
    /// empty batch.
    pub fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> io::Result<()> {
        ready.clear();

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        for event in self.events.iter() {
            ready.push(Ready {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    #[test]
    fn test_poll_reports_acceptable_listener() {
        let mut poller = Poller::new(16).unwrap();

        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();
        poller
            .register(&mut listener, Token(7), Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(local).unwrap();

        let mut ready = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ready.is_empty() && std::time::Instant::now() < deadline {
            poller
                .poll(Some(Duration::from_millis(100)), &mut ready)
                .unwrap();
        }

        assert!(ready.iter().any(|r| r.token == Token(7) && r.readable));
    }

    #[test]
    fn test_poll_times_out_with_empty_batch() {
        let mut poller = Poller::new(16).unwrap();
        let mut ready = vec![Ready {
            token: Token(0),
            readable: true,
            writable: false,
            error: false,
        }];

        poller
            .poll(Some(Duration::from_millis(10)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_waker_interrupts_poll() {
        let mut poller = Poller::new(16).unwrap();
        let waker = poller.waker(Token(99)).unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let mut ready = Vec::new();
        poller.poll(Some(Duration::from_secs(5)), &mut ready).unwrap();
        handle.join().unwrap();

        assert!(ready.iter().any(|r| r.token == Token(99)));
    }
}
