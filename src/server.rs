//! Server bootstrap and shutdown coordination.
//!
//! Startup: load the TLS material if enabled, bind the listener, spawn
//! the boss and worker groups, install the acceptor on the boss group and
//! wait for its registration ack. `start` returns only once the listener
//! is bound and being polled; any failure on that path tears the groups
//! down again so nothing is leaked.

use crate::config::Config;
use crate::pipeline::{self, PipelineFactory};
use crate::reactor::{Acceptor, EventLoopGroup, Task, WorkerOptions};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// How long startup waits for the boss worker to confirm the listener is
/// registered and polled.
const REGISTRATION_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    boss: Arc<EventLoopGroup>,
    workers: Arc<EventLoopGroup>,
    local_addr: SocketAddr,
    close: CloseNotify,
    shut_down: AtomicBool,
    quiet_period: Duration,
    timeout: Duration,
}

impl Server {
    /// Bind and start serving. On return the listening socket is bound,
    /// registered, and accepting.
    pub fn start(config: &Config) -> io::Result<Server> {
        let tls = if config.tls {
            let cert = require_path(config.tls_cert.as_deref(), "tls_cert")?;
            let key = require_path(config.tls_key.as_deref(), "tls_key")?;
            Some(pipeline::load_server_config(cert, key)?)
        } else {
            None
        };

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let opts = WorkerOptions {
            event_capacity: 256,
            buffer_size: config.buffer_size,
            max_connections: config.max_connections,
        };
        let quiet_period = config.shutdown_quiet_period();
        let timeout = config.shutdown_timeout();

        let workers = Arc::new(EventLoopGroup::new(
            "worker",
            config.worker_count(),
            opts.clone(),
        )?);
        let boss = match EventLoopGroup::new("boss", config.boss_threads, opts) {
            Ok(group) => Arc::new(group),
            Err(e) => {
                workers.shutdown_gracefully(quiet_period, timeout);
                return Err(e);
            }
        };

        let factory = PipelineFactory::new(tls);
        let acceptor = match Acceptor::bind(
            addr,
            config.backlog,
            factory,
            Arc::clone(&workers),
            config.accept_batch,
        ) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                teardown(&boss, &workers, quiet_period, timeout);
                return Err(e);
            }
        };
        let local_addr = acceptor.local_addr();

        // Mirror a synchronous bind: wait until the boss worker has the
        // listener registered and polled.
        let (ack, registered) = mpsc::channel();
        let installed = boss
            .next()
            .submit(Task::Listen { acceptor, ack })
            .and_then(|_| match registered.recv_timeout(REGISTRATION_ACK_TIMEOUT) {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "listener registration not acknowledged",
                )),
            });
        if let Err(e) = installed {
            teardown(&boss, &workers, quiet_period, timeout);
            return Err(e);
        }

        info!(
            addr = %local_addr,
            tls = config.tls,
            workers = workers.size(),
            "server started"
        );
        Ok(Server {
            boss,
            workers,
            local_addr,
            close: CloseNotify::new(),
            shut_down: AtomicBool::new(false),
            quiet_period,
            timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request close. Safe from any thread; unblocks `await_close`.
    pub fn close(&self) {
        self.close.notify();
    }

    /// Block until close is requested.
    pub fn await_close(&self) {
        self.close.wait();
    }

    /// Ordered graceful shutdown: the boss group first so no new
    /// connections are accepted, then the workers drain. A group that
    /// misses the deadline is a warning, not a failure.
    pub fn shutdown_gracefully(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close();

        for (name, group) in [("boss", &self.boss), ("worker", &self.workers)] {
            let stragglers = group.shutdown_gracefully(self.quiet_period, self.timeout);
            if !stragglers.is_empty() {
                warn!(
                    group = name,
                    workers = ?stragglers,
                    "workers did not stop within the shutdown timeout"
                );
            }
        }
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_gracefully();
    }
}

/// Startup failed partway: stop whatever groups already have threads.
fn teardown(
    boss: &EventLoopGroup,
    workers: &EventLoopGroup,
    quiet_period: Duration,
    timeout: Duration,
) {
    boss.shutdown_gracefully(quiet_period, timeout);
    workers.shutdown_gracefully(quiet_period, timeout);
}

fn require_path<'a>(
    path: Option<&'a std::path::Path>,
    what: &str,
) -> io::Result<&'a std::path::Path> {
    path.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("tls enabled but {what} not set"),
        )
    })
}

/// One-shot close notification shared between the signal thread, the
/// main thread, and anything else holding the server.
struct CloseNotify {
    closed: Mutex<bool>,
    condvar: Condvar,
}

impl CloseNotify {
    fn new() -> Self {
        Self {
            closed: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut closed = match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *closed = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut closed = match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*closed {
            closed = match self.condvar.wait(closed) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn test_config(port: u16) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            backlog: 64,
            tls: false,
            tls_cert: None,
            tls_key: None,
            boss_threads: 1,
            worker_threads: 2,
            accept_batch: 8,
            buffer_size: 4096,
            max_connections: 128,
            shutdown_quiet_period_secs: 1,
            shutdown_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        client
    }

    #[test]
    fn test_echoes_bytes_on_a_single_connection() {
        let server = Server::start(&test_config(0)).unwrap();
        let mut client = connect(server.local_addr());

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // A second exchange on the same connection.
        client.write_all(b"again").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"again");

        server.shutdown_gracefully();
    }

    #[test]
    fn test_concurrent_clients_are_isolated() {
        let server = Server::start(&test_config(0)).unwrap();
        let addr = server.local_addr();

        // More clients than workers; each echoes a distinct byte pattern.
        let handles: Vec<_> = (0..8u8)
            .map(|tag| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    let payload = vec![tag; 512];
                    for _ in 0..20 {
                        client.write_all(&payload).unwrap();
                        let mut echoed = vec![0u8; payload.len()];
                        client.read_exact(&mut echoed).unwrap();
                        assert_eq!(echoed, payload, "client {tag} got foreign bytes");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        server.shutdown_gracefully();
    }

    #[test]
    fn test_large_burst_echoes_without_deadlock() {
        let server = Server::start(&test_config(0)).unwrap();
        let mut client = connect(server.local_addr());
        client
            .set_read_timeout(Some(Duration::from_secs(60)))
            .unwrap();

        // One 10MB burst, far beyond any socket buffer: the server must
        // keep reading while its own writes back up.
        let payload: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut writer = client.try_clone().unwrap();
        let producer = thread::spawn(move || {
            writer.write_all(&payload).unwrap();
        });

        let mut echoed = vec![0u8; expected.len()];
        client.read_exact(&mut echoed).unwrap();
        producer.join().unwrap();

        assert!(echoed == expected, "echoed stream diverged from input");
        server.shutdown_gracefully();
    }

    #[test]
    fn test_no_accepts_after_shutdown() {
        let server = Server::start(&test_config(0)).unwrap();
        let addr = server.local_addr();

        // Sanity: the listener accepts before shutdown.
        drop(connect(addr));

        server.shutdown_gracefully();

        let result = TcpStream::connect_timeout(&addr, Duration::from_millis(500));
        assert!(result.is_err(), "listener still accepting after shutdown");
    }

    #[test]
    fn test_bind_conflict_fails_startup() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = Server::start(&test_config(port));
        assert!(result.is_err());
    }

    #[test]
    fn test_close_unblocks_await() {
        let server = Arc::new(Server::start(&test_config(0)).unwrap());

        let closer = Arc::clone(&server);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });

        server.await_close();
        handle.join().unwrap();
        server.shutdown_gracefully();
    }
}
