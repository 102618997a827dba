//! Per-connection processing pipeline.
//!
//! A pipeline is an ordered chain of stages built once per accepted
//! connection. Inbound bytes (from the socket) run through the stages in
//! order; bytes a stage emits toward the peer run back through the stages
//! in front of it, so an encrypting first stage sees every outbound byte
//! last. Stage order is fixed for the connection's lifetime.

mod echo;
mod tls;

pub use echo::EchoStage;
pub use tls::{load_server_config, TlsStage};

use bytes::BytesMut;
use std::io;
use std::sync::Arc;

/// Context handed to a stage while it processes inbound data.
pub struct InboundContext<'a> {
    forward: &'a mut BytesMut,
    respond: &'a mut BytesMut,
}

impl InboundContext<'_> {
    /// Pass bytes on to the next stage, toward the application.
    pub fn forward(&mut self, data: &[u8]) {
        self.forward.extend_from_slice(data);
    }

    /// Queue bytes for transmission toward the peer. They enter the
    /// outbound path at this stage's position, so only stages closer to
    /// the socket get to transform them.
    pub fn respond(&mut self, data: &[u8]) {
        self.respond.extend_from_slice(data);
    }
}

/// One unit of per-connection byte processing.
///
/// All callbacks run on the connection's owning worker thread; a stage
/// never needs internal synchronization.
pub trait Stage: Send {
    /// The connection was registered on its worker. Bytes pushed into
    /// `respond` travel toward the peer.
    fn on_active(&mut self, respond: &mut BytesMut) -> io::Result<()> {
        let _ = respond;
        Ok(())
    }

    /// The connection is being released. Terminal; no output path.
    fn on_inactive(&mut self) {}

    /// An error is about to close the connection.
    fn on_error(&mut self, error: &io::Error) {
        let _ = error;
    }

    /// Bytes moving from the socket toward the application.
    fn on_inbound(&mut self, data: &[u8], ctx: &mut InboundContext<'_>) -> io::Result<()>;

    /// Bytes moving from the application toward the socket. The default
    /// passes them through unmodified.
    fn on_outbound(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        out.extend_from_slice(data);
        Ok(())
    }
}

/// Ordered stage chain for one connection.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    active: bool,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            stages,
            active: false,
        }
    }

    /// Fire the active event through the chain, collecting any bytes the
    /// stages want on the wire (e.g. protocol greetings) into `wire`.
    pub fn fire_active(&mut self, wire: &mut BytesMut) -> io::Result<()> {
        self.active = true;
        for i in 0..self.stages.len() {
            let mut respond = BytesMut::new();
            self.stages[i].on_active(&mut respond)?;
            if !respond.is_empty() {
                self.run_outbound(i, &respond, wire)?;
            }
        }
        Ok(())
    }

    /// Run bytes read from the socket through every stage in order.
    /// Bytes destined for the peer are appended to `wire`.
    pub fn fire_inbound(&mut self, data: &[u8], wire: &mut BytesMut) -> io::Result<()> {
        let mut inbound = BytesMut::from(data);
        for i in 0..self.stages.len() {
            if inbound.is_empty() {
                break;
            }
            let mut forward = BytesMut::new();
            let mut respond = BytesMut::new();
            {
                let mut ctx = InboundContext {
                    forward: &mut forward,
                    respond: &mut respond,
                };
                self.stages[i].on_inbound(&inbound, &mut ctx)?;
            }
            if !respond.is_empty() {
                self.run_outbound(i, &respond, wire)?;
            }
            inbound = forward;
        }
        Ok(())
    }

    /// Fire the inactive event once, head to tail.
    pub fn fire_inactive(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        for stage in self.stages.iter_mut() {
            stage.on_inactive();
        }
    }

    /// Tell every stage the connection is going down with an error.
    pub fn fire_error(&mut self, error: &io::Error) {
        for stage in self.stages.iter_mut() {
            stage.on_error(error);
        }
    }

    /// Run bytes emitted at stage `from` back toward the socket, through
    /// the stages in front of it in reverse order.
    fn run_outbound(&mut self, from: usize, data: &[u8], wire: &mut BytesMut) -> io::Result<()> {
        let mut outbound = BytesMut::from(data);
        for i in (0..from).rev() {
            if outbound.is_empty() {
                break;
            }
            let mut next = BytesMut::new();
            self.stages[i].on_outbound(&outbound, &mut next)?;
            outbound = next;
        }
        wire.extend_from_slice(&outbound);
        Ok(())
    }
}

/// Builds one pipeline per accepted connection.
///
/// The factory owns all configuration the stages need (notably the TLS
/// server config), handed to it once at startup; stages receive it at
/// construction rather than reaching for shared state.
pub struct PipelineFactory {
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl PipelineFactory {
    pub fn new(tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self { tls }
    }

    pub fn build(&self) -> io::Result<Pipeline> {
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(2);
        if let Some(config) = &self.tls {
            stages.push(Box::new(TlsStage::new(Arc::clone(config))?));
        }
        stages.push(Box::new(EchoStage));
        Ok(Pipeline::new(stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inbound: uppercases and forwards. Outbound: wraps in parentheses.
    struct Framing;

    impl Stage for Framing {
        fn on_inbound(&mut self, data: &[u8], ctx: &mut InboundContext<'_>) -> io::Result<()> {
            let upper: Vec<u8> = data.iter().map(|b| b.to_ascii_uppercase()).collect();
            ctx.forward(&upper);
            Ok(())
        }

        fn on_outbound(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
            out.extend_from_slice(b"(");
            out.extend_from_slice(data);
            out.extend_from_slice(b")");
            Ok(())
        }
    }

    /// Counts lifecycle events through shared atomics.
    struct Probe {
        active: Arc<AtomicUsize>,
        inactive: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    impl Stage for Probe {
        fn on_active(&mut self, _respond: &mut BytesMut) -> io::Result<()> {
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_inactive(&mut self) {
            self.inactive.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&mut self, _error: &io::Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_inbound(&mut self, data: &[u8], ctx: &mut InboundContext<'_>) -> io::Result<()> {
            ctx.forward(data);
            Ok(())
        }
    }

    #[test]
    fn test_echo_pipeline_round_trips_bytes() {
        let mut pipeline = Pipeline::new(vec![Box::new(EchoStage)]);
        let mut wire = BytesMut::new();

        pipeline.fire_inbound(b"hello", &mut wire).unwrap();
        assert_eq!(&wire[..], b"hello");

        wire.clear();
        pipeline.fire_inbound(&[0u8, 255, 1, 2], &mut wire).unwrap();
        assert_eq!(&wire[..], &[0u8, 255, 1, 2]);
    }

    #[test]
    fn test_outbound_runs_back_through_earlier_stages() {
        // Framing sits socket-side of the echo stage, so echoed bytes are
        // uppercased on the way in and parenthesized on the way out.
        let mut pipeline = Pipeline::new(vec![Box::new(Framing), Box::new(EchoStage)]);
        let mut wire = BytesMut::new();

        pipeline.fire_inbound(b"abc", &mut wire).unwrap();
        assert_eq!(&wire[..], b"(ABC)");
    }

    #[test]
    fn test_lifecycle_events_fire_once() {
        let active = Arc::new(AtomicUsize::new(0));
        let inactive = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let probe = Probe {
            active: Arc::clone(&active),
            inactive: Arc::clone(&inactive),
            errors: Arc::clone(&errors),
        };
        let mut pipeline = Pipeline::new(vec![Box::new(probe), Box::new(EchoStage)]);

        let mut wire = BytesMut::new();
        pipeline.fire_active(&mut wire).unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 1);

        pipeline.fire_error(&io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        pipeline.fire_inactive();
        pipeline.fire_inactive();
        assert_eq!(inactive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_builds_echo_only_without_tls() {
        let factory = PipelineFactory::new(None);
        let mut pipeline = factory.build().unwrap();

        let mut wire = BytesMut::new();
        pipeline.fire_inbound(b"ping", &mut wire).unwrap();
        assert_eq!(&wire[..], b"ping");
    }
}
