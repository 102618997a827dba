//! Byte-for-byte echo stage.

use super::{InboundContext, Stage};
use std::io;

/// Innermost stage: schedules every inbound byte for transmission back to
/// the peer, unmodified and in order. No coalescing, no splitting.
pub struct EchoStage;

impl Stage for EchoStage {
    fn on_inbound(&mut self, data: &[u8], ctx: &mut InboundContext<'_>) -> io::Result<()> {
        ctx.respond(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_echo_responds_with_exact_bytes() {
        let mut stage = EchoStage;
        let mut forward = BytesMut::new();
        let mut respond = BytesMut::new();
        let mut ctx = InboundContext {
            forward: &mut forward,
            respond: &mut respond,
        };

        stage.on_inbound(b"hello", &mut ctx).unwrap();
        assert_eq!(&respond[..], b"hello");
        assert!(forward.is_empty());
    }
}
