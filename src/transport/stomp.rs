//! STOMP 1.2 over TCP or TLS
//!
//! Only the client frames the relay needs: CONNECT, SEND with a receipt,
//! DISCONNECT. Every SEND blocks until the matching RECEIPT (or an ERROR)
//! comes back, so a returned `Ok` means the broker has the message.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use super::tls::{self, TlsStream};
use super::{Connection, Connector, TransportSecurity};
use crate::broker::BrokerEndpoint;
use crate::error::TransportError;
use crate::unload::OutboundMessage;

const STOMP_VERSION: &str = "1.2";
/// Upper bound on a single inbound frame; brokers only ever send us small ones.
const MAX_FRAME_BYTES: usize = 1 << 20;

pub const HEADER_MESSAGE_ID: &str = "usage-message-id";
pub const HEADER_DIGEST: &str = "usage-digest";
pub const HEADER_KIND: &str = "usage-kind";
pub const HEADER_SOURCE: &str = "usage-source";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `key`; repeated headers keep the first occurrence.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(command: &str) -> bool {
        !matches!(command, "CONNECT" | "CONNECTED")
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = Self::escapes_headers(&self.command);
        let mut out = Vec::with_capacity(self.body.len() + 128);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (key, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(key).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(key.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Read one frame, skipping heart-beat newlines. `Ok(None)` on a clean
    /// end of stream before any frame byte.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Option<Self>, TransportError> {
        let command = loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                break line.to_string();
            }
        };

        let escape = Self::escapes_headers(&command);
        let mut headers = Vec::new();
        let mut header_bytes = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(protocol("stream ended inside frame headers"));
            }
            header_bytes += line.len();
            if header_bytes > MAX_FRAME_BYTES {
                return Err(protocol("frame headers too large"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| protocol(format!("malformed header line `{}`", line)))?;
            if escape {
                headers.push((unescape_header(key)?, unescape_header(value)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| protocol(format!("bad content-length `{}`", v)))
            })
            .transpose()?;

        let body = match content_length {
            Some(len) if len > MAX_FRAME_BYTES => return Err(protocol("frame body too large")),
            Some(len) => {
                let mut body = vec![0u8; len];
                reader.read_exact(&mut body)?;
                let mut nul = [0u8; 1];
                reader.read_exact(&mut nul)?;
                if nul[0] != 0 {
                    return Err(protocol("frame body not NUL terminated"));
                }
                body
            }
            None => {
                let mut body = Vec::new();
                reader.read_until(0, &mut body)?;
                if body.pop() != Some(0) {
                    return Err(protocol("stream ended inside frame body"));
                }
                body
            }
        };

        Ok(Some(Self {
            command,
            headers,
            body,
        }))
    }
}

fn protocol(reason: impl Into<String>) -> TransportError {
    TransportError::Protocol(reason.into())
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(escaped: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(protocol(format!(
                    "undefined escape `\\{}`",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl BrokerStream {
    fn socket(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref(),
        }
    }
}

impl Read for BrokerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for BrokerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens STOMP sessions with a fixed socket timeout.
#[derive(Debug, Clone)]
pub struct StompConnector {
    timeout: Duration,
}

impl StompConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn open_socket(&self, endpoint: &BrokerEndpoint) -> Result<TcpStream, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason,
        };
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(socket) => {
                    socket.set_read_timeout(Some(self.timeout))?;
                    socket.set_write_timeout(Some(self.timeout))?;
                    socket.set_nodelay(true)?;
                    return Ok(socket);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(connect_err(
            last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string()),
        ))
    }
}

impl Connector for StompConnector {
    fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        security: &TransportSecurity,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let socket = self.open_socket(endpoint)?;
        let stream = match (endpoint.secure, security.credentials()) {
            (true, Some(credentials)) => {
                let config = tls::client_config(credentials)?;
                BrokerStream::Tls(Box::new(tls::wrap(config, &endpoint.host, socket)?))
            }
            (true, None) => {
                return Err(TransportError::Tls(format!(
                    "{} requires TLS but no credentials are configured",
                    endpoint
                )))
            }
            (false, _) => BrokerStream::Plain(socket),
        };

        let mut connection = StompConnection {
            reader: BufReader::new(stream),
            receipts: 0,
            open: false,
        };
        connection.handshake(&endpoint.host)?;
        Ok(Box::new(connection))
    }
}

struct StompConnection {
    reader: BufReader<BrokerStream>,
    receipts: u64,
    open: bool,
}

impl StompConnection {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.write_all(&frame.encode())?;
        stream.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, TransportError> {
        Frame::read_from(&mut self.reader)?
            .ok_or_else(|| protocol("broker closed the connection"))
    }

    fn handshake(&mut self, host: &str) -> Result<(), TransportError> {
        let connect = Frame::new("CONNECT")
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0");
        self.write_frame(&connect)?;

        let reply = self.read_frame()?;
        match reply.command.as_str() {
            "CONNECTED" => {
                debug!(
                    "STOMP session established (server: {})",
                    reply.get("server").unwrap_or("unknown")
                );
                self.open = true;
                Ok(())
            }
            "ERROR" => Err(protocol(format!(
                "connect refused: {}",
                reply.get("message").unwrap_or("no reason given")
            ))),
            other => Err(protocol(format!("unexpected {} frame during connect", other))),
        }
    }

    fn next_receipt(&mut self) -> String {
        self.receipts += 1;
        format!("r-{}", self.receipts)
    }

    fn await_receipt(&mut self, receipt: &str) -> Result<(), TransportError> {
        let reply = self.read_frame()?;
        match reply.command.as_str() {
            "RECEIPT" if reply.get("receipt-id") == Some(receipt) => Ok(()),
            "RECEIPT" => Err(protocol(format!(
                "receipt {} while waiting for {}",
                reply.get("receipt-id").unwrap_or("?"),
                receipt
            ))),
            "ERROR" => Err(protocol(
                reply.get("message").unwrap_or("broker error").to_string(),
            )),
            other => Err(protocol(format!("unexpected {} frame", other))),
        }
    }
}

impl Connection for StompConnection {
    fn send(&mut self, destination: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let receipt = self.next_receipt();
        let frame = Frame::new("SEND")
            .header("destination", destination)
            .header("content-type", message.format().content_type())
            .header("persistent", "true")
            .header("receipt", receipt.as_str())
            .header(HEADER_MESSAGE_ID, message.id())
            .header(HEADER_DIGEST, message.digest())
            .header(HEADER_KIND, message.kind().header_name())
            .header(HEADER_SOURCE, message.source())
            .body(message.body().as_bytes());
        self.write_frame(&frame)?;
        self.await_receipt(&receipt)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let receipt = self.next_receipt();
        let result = self
            .write_frame(&Frame::new("DISCONNECT").header("receipt", receipt.as_str()))
            .and_then(|_| self.await_receipt(&receipt));
        if let Err(e) = &result {
            warn!("Broker did not acknowledge disconnect: {}", e);
        }
        let _ = self.reader.get_ref().socket().shutdown(Shutdown::Both);
        result
    }
}

impl Drop for StompConnection {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}
