//! Event-loop worker: one dedicated thread multiplexing many sockets.
//!
//! Loop shape: drain the task queue, poll for readiness, run each ready
//! socket's work (accept, read, write) synchronously on this thread. All
//! I/O and pipeline execution for a connection happen here for its entire
//! lifetime, so per-connection state needs no locks. Other threads reach
//! the worker only through its task queue, paired with a poll waker.

use crate::reactor::{Acceptor, Connection, Poller, Ready, LISTENER_TOKEN, WAKER_TOKEN};
use mio::{Interest, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Work submitted to a worker from another thread.
pub enum Task {
    /// Register a freshly accepted connection on this worker.
    Register(Connection),
    /// Install the listening socket; the result is acknowledged so the
    /// caller can treat registration failure as a startup error.
    Listen {
        acceptor: Acceptor,
        ack: Sender<io::Result<()>>,
    },
    /// Begin graceful shutdown with the given drain budget.
    Shutdown { drain: Duration },
}

/// Tuning shared by every worker in a group.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Readiness events fetched per poll.
    pub event_capacity: usize,
    /// Read scratch buffer size in bytes.
    pub buffer_size: usize,
    /// Maximum concurrent connections owned by one worker.
    pub max_connections: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            buffer_size: 16 * 1024,
            max_connections: 10240,
        }
    }
}

/// Handle to a running worker, shared by the group and the acceptor.
pub struct WorkerHandle {
    id: usize,
    sender: Sender<Task>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a task and wake the worker's poll.
    pub fn submit(&self, task: Task) -> io::Result<()> {
        self.sender
            .send(task)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker has exited"))?;
        self.waker.wake()
    }

    /// Wait for the worker thread to exit, up to `deadline`.
    /// Returns false if it was still running when the deadline passed.
    pub fn join_by(&self, deadline: Instant) -> bool {
        let mut slot = match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(handle) = slot.take() else {
            return true;
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                *slot = Some(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}

/// Spawn a worker thread and return its handle.
pub fn spawn(name: &str, id: usize, opts: WorkerOptions) -> io::Result<WorkerHandle> {
    let poller = Poller::new(opts.event_capacity)?;
    let waker = Arc::new(poller.waker(WAKER_TOKEN)?);
    let (sender, tasks) = mpsc::channel();

    let thread_name = format!("{name}-{id}");
    let thread = thread::Builder::new().name(thread_name).spawn(move || {
        let mut worker = Worker {
            id,
            poller,
            tasks,
            connections: Slab::with_capacity(opts.max_connections.min(1024)),
            acceptor: None,
            scratch: vec![0u8; opts.buffer_size],
            max_connections: opts.max_connections,
            draining: false,
            drain_deadline: None,
        };
        worker.run();
    })?;

    Ok(WorkerHandle {
        id,
        sender,
        waker,
        thread: Mutex::new(Some(thread)),
    })
}

struct Worker {
    id: usize,
    poller: Poller,
    tasks: Receiver<Task>,
    connections: Slab<Connection>,
    acceptor: Option<Acceptor>,
    scratch: Vec<u8>,
    max_connections: usize,
    draining: bool,
    drain_deadline: Option<Instant>,
}

impl Worker {
    fn run(&mut self) {
        debug!(worker = self.id, "worker started");
        let mut ready = Vec::new();

        loop {
            self.drain_tasks();

            if self.draining && (self.flushed() || self.deadline_passed()) {
                break;
            }

            if let Err(e) = self.poller.poll(self.poll_timeout(), &mut ready) {
                error!(worker = self.id, error = %e, "poll failed, stopping worker");
                break;
            }

            for event in &ready {
                match event.token {
                    WAKER_TOKEN => {} // tasks are drained at the top of the loop
                    LISTENER_TOKEN => self.on_acceptable(),
                    Token(key) => self.on_socket_event(key, event),
                }
            }
        }

        self.teardown();
        debug!(worker = self.id, "worker stopped");
    }

    /// Run queued tasks before polling, preserving single-threaded
    /// execution for all connection state.
    fn drain_tasks(&mut self) {
        loop {
            match self.tasks.try_recv() {
                Ok(Task::Register(conn)) => self.register_connection(conn),
                Ok(Task::Listen { acceptor, ack }) => {
                    let _ = ack.send(self.install_acceptor(acceptor));
                }
                Ok(Task::Shutdown { drain }) => self.begin_drain(drain),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Every handle is gone; nothing can reach us anymore.
                    self.begin_drain(Duration::ZERO);
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, mut conn: Connection) {
        if self.draining {
            debug!(worker = self.id, peer = %conn.peer, "draining, dropping new connection");
            return;
        }
        if self.connections.len() >= self.max_connections {
            warn!(worker = self.id, peer = %conn.peer, "connection limit reached");
            return;
        }

        if let Err(e) = self
            .poller
            .register(&mut conn.stream, Token(self.connections.vacant_key()), conn.interest)
        {
            warn!(worker = self.id, peer = %conn.peer, error = %e, "failed to register connection");
            return;
        }
        let key = self.connections.insert(conn);

        if let Err(e) = self.connections[key].fire_active() {
            debug!(worker = self.id, error = %e, "connection failed on activation");
            self.close_connection(key, None);
            return;
        }
        if self.update_interest(key).is_err() {
            self.close_connection(key, None);
            return;
        }

        debug!(
            worker = self.id,
            peer = %self.connections[key].peer,
            connections = self.connections.len(),
            "connection registered"
        );
    }

    fn install_acceptor(&mut self, mut acceptor: Acceptor) -> io::Result<()> {
        if self.draining {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker is shutting down",
            ));
        }
        acceptor.register(&self.poller, LISTENER_TOKEN)?;
        info!(worker = self.id, addr = %acceptor.local_addr(), "listener registered");
        self.acceptor = Some(acceptor);
        Ok(())
    }

    fn begin_drain(&mut self, drain: Duration) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.drain_deadline = Some(Instant::now() + drain);

        // Close the listening socket first so no new connections appear.
        if let Some(mut acceptor) = self.acceptor.take() {
            let _ = self.poller.deregister(acceptor.listener_mut());
            debug!(worker = self.id, "listener closed");
        }
        debug!(
            worker = self.id,
            connections = self.connections.len(),
            "draining"
        );
    }

    fn on_acceptable(&mut self) {
        if let Some(acceptor) = self.acceptor.as_mut() {
            acceptor.on_acceptable(&self.poller);
        }
    }

    fn on_socket_event(&mut self, key: usize, event: &Ready) {
        if !self.connections.contains(key) {
            return;
        }
        match self.drive_connection(key, event) {
            Ok(true) => {
                if self.update_interest(key).is_err() {
                    self.close_connection(key, None);
                }
            }
            Ok(false) => self.close_connection(key, None),
            Err(e) => {
                debug!(worker = self.id, key, error = %e, "connection error");
                self.close_connection(key, Some(&e));
            }
        }
    }

    /// Returns Ok(false) when the peer closed and the connection should
    /// be released without treating it as an error.
    fn drive_connection(&mut self, key: usize, event: &Ready) -> io::Result<bool> {
        let conn = &mut self.connections[key];

        if event.error {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "socket reported an error condition",
            ));
        }

        // While draining, only flush; inbound data is no longer served.
        if self.draining {
            if event.writable {
                conn.on_writable()?;
            }
            return Ok(true);
        }

        if event.readable && !conn.on_readable(&mut self.scratch)? {
            return Ok(false);
        }
        if event.writable {
            conn.on_writable()?;
        }
        Ok(true)
    }

    /// Keep WRITABLE in the interest set exactly while bytes are pending.
    fn update_interest(&mut self, key: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        let wanted = if conn.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if wanted != conn.interest {
            self.poller.reregister(&mut conn.stream, Token(key), wanted)?;
            conn.interest = wanted;
        }
        Ok(())
    }

    fn close_connection(&mut self, key: usize, error: Option<&io::Error>) {
        if let Some(mut conn) = self.connections.try_remove(key) {
            let _ = self.poller.deregister(&mut conn.stream);
            if let Some(e) = error {
                conn.fire_error(e);
            }
            conn.fire_inactive();
            debug!(
                worker = self.id,
                peer = %conn.peer,
                connections = self.connections.len(),
                "connection closed"
            );
        }
    }

    /// All pending outbound data flushed?
    fn flushed(&self) -> bool {
        self.connections.iter().all(|(_, c)| !c.wants_write())
    }

    fn deadline_passed(&self) -> bool {
        self.drain_deadline
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let deadline = self.drain_deadline?;
        Some(
            deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(100)),
        )
    }

    fn teardown(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EchoStage, Pipeline};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn accepted_pair(handle: &WorkerHandle) -> TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        let conn = Connection::new(
            mio::net::TcpStream::from_std(stream),
            peer,
            Pipeline::new(vec![Box::new(EchoStage)]),
        );
        handle.submit(Task::Register(conn)).unwrap();
        client
    }

    #[test]
    fn test_worker_echoes_registered_connection() {
        let handle = spawn("test", 0, WorkerOptions::default()).unwrap();
        let mut client = accepted_pair(&handle);

        client.write_all(b"ping").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        handle
            .submit(Task::Shutdown {
                drain: Duration::from_secs(1),
            })
            .unwrap();
        assert!(handle.join_by(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_joins_idle_worker() {
        let handle = spawn("test", 1, WorkerOptions::default()).unwrap();
        handle
            .submit(Task::Shutdown {
                drain: Duration::from_secs(1),
            })
            .unwrap();
        assert!(handle.join_by(Instant::now() + Duration::from_secs(5)));
    }
}
