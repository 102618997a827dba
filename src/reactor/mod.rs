//! Reactor core: readiness polling, event-loop workers, worker groups,
//! and the acceptor that feeds them.
//!
//! One OS thread per worker, fixed for the process lifetime. Every
//! connection is owned by exactly one worker; the only cross-thread
//! traffic is the task queue each worker drains at the top of its loop.

mod acceptor;
mod connection;
mod group;
mod poller;
mod worker;

pub use acceptor::Acceptor;
pub use connection::Connection;
pub use group::EventLoopGroup;
pub use poller::{Poller, Ready};
pub use worker::{Task, WorkerOptions};

use mio::Token;

/// Wakes a worker's poll when a task is queued from another thread.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// The worker's listening socket, if it hosts the acceptor.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
