//! Transport security stage backed by rustls.
//!
//! The stage is sans-io: ciphertext goes in through `on_inbound`,
//! plaintext comes back out through `on_outbound`, and the rustls session
//! never touches the socket itself. Handshake records the session wants to
//! send surface as respond bytes at this stage's position, which is the
//! front of the chain, so they hit the wire untouched.

use super::{InboundContext, Stage};
use bytes::{BufMut, BytesMut};
use rustls::{ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Load a PEM certificate chain and private key into a server-side
/// rustls configuration. Any failure here is a startup error.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no certificates found in {}", cert_path.display()),
        ));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no private key found in {}", key_path.display()),
        )
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    Ok(Arc::new(config))
}

/// First pipeline stage when TLS is enabled: handshake, then transparent
/// decrypt of inbound records and encrypt of outbound plaintext.
pub struct TlsStage {
    session: ServerConnection,
    established: bool,
}

impl TlsStage {
    pub fn new(config: Arc<ServerConfig>) -> io::Result<Self> {
        let session = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            session,
            established: false,
        })
    }

    /// Drain pending TLS records (handshake or application data) from the
    /// session into `out`.
    fn drain_session(&mut self, out: &mut BytesMut) -> io::Result<()> {
        let mut writer = (&mut *out).writer();
        while self.session.wants_write() {
            self.session.write_tls(&mut writer)?;
        }
        Ok(())
    }
}

impl Stage for TlsStage {
    fn on_inbound(&mut self, data: &[u8], ctx: &mut InboundContext<'_>) -> io::Result<()> {
        let mut input = data;
        while !input.is_empty() {
            let consumed = self.session.read_tls(&mut input)?;
            if consumed == 0 {
                break;
            }

            let state = self
                .session
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut plaintext = vec![0u8; pending];
                self.session.reader().read_exact(&mut plaintext)?;
                ctx.forward(&plaintext);
            }
        }

        // Handshake responses and any buffered records.
        let mut records = BytesMut::new();
        self.drain_session(&mut records)?;
        if !records.is_empty() {
            ctx.respond(&records);
        }

        if !self.established && !self.session.is_handshaking() {
            self.established = true;
            debug!("tls session established");
        }
        Ok(())
    }

    fn on_outbound(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        self.session.writer().write_all(data)?;
        self.drain_session(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_certificate_is_a_startup_error() {
        let result = load_server_config(
            &PathBuf::from("/nonexistent/server.pem"),
            &PathBuf::from("/nonexistent/server.key"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let cert = dir.join("echoserve-test-garbage.pem");
        let key = dir.join("echoserve-test-garbage.key");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let result = load_server_config(&cert, &key);
        assert!(result.is_err());

        let _ = std::fs::remove_file(&cert);
        let _ = std::fs::remove_file(&key);
    }
}
