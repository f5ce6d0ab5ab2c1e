//! Serial link to the modem.
//!
//! Writes go straight to the port under a mutex; reads happen on a dedicated
//! thread that decodes `\r\n`-terminated lines and forwards them over an
//! unbounded channel. There is no ordering between callers at this layer: the
//! AT engine above serializes access.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use tokio::sync::mpsc;

use super::error::TransportError;
use crate::logutil::escape_log;

#[cfg(feature = "serial")]
use crate::config::GatewayConfig;
#[cfg(feature = "serial")]
use log::{info, warn};

/// Upper bound for one buffered line; longer garbage is dropped.
const MAX_LINE_BYTES: usize = 4096;

/// Items produced by the reader side of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Line(String),
    /// The link ended; carries the I/O error text when it was not a local close.
    Closed(Option<String>),
}

/// Incremental `\r\n` line decoder.
///
/// Blank lines are skipped. A bare `>` prompt (sent by the modem after
/// `AT+CMGS` without a line terminator) is emitted as its own line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        if self.buf.iter().all(|b| b.is_ascii_whitespace() || *b == b'>')
            && self.buf.contains(&b'>')
        {
            self.buf.clear();
            lines.push(">".to_string());
        } else if self.buf.len() > MAX_LINE_BYTES {
            debug!("dropping {} bytes of unterminated input", self.buf.len());
            self.buf.clear();
        }
        lines
    }
}

/// Write half of the link plus the open/closed flag shared with the reader.
pub struct ModemTransport {
    port_name: String,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    open: Arc<AtomicBool>,
}

/// An open link: the write half and the stream of decoded lines.
pub struct ModemLink {
    pub transport: ModemTransport,
    pub lines: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ModemTransport {
    /// Wrap an arbitrary writer. The caller feeds the matching line channel.
    pub fn new(port_name: impl Into<String>, writer: Box<dyn Write + Send>) -> Self {
        Self::with_flag(port_name, writer, Arc::new(AtomicBool::new(true)))
    }

    fn with_flag(
        port_name: impl Into<String>,
        writer: Box<dyn Write + Send>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            writer: Mutex::new(Some(writer)),
            open,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write raw text as-is. Command terminators are the caller's business.
    pub fn write(&self, raw: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        trace!("TX {}: {}", self.port_name, escape_log(raw));
        let result = writer
            .write_all(raw.as_bytes())
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            self.open.store(false, Ordering::Release);
            *guard = None;
            return Err(TransportError::Write(e));
        }
        Ok(())
    }

    /// Drop the write half and signal the reader thread to stop.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            debug!("Closed modem link on {}", self.port_name);
        }
    }

    /// Open the configured serial port and start the reader thread.
    #[cfg(feature = "serial")]
    pub async fn open(config: &GatewayConfig) -> Result<ModemLink, TransportError> {
        use std::io::Read;
        use std::time::Duration;

        let port_name = config.port().to_string();
        info!(
            "Opening modem on {} at {} baud",
            port_name,
            config.baud_rate()
        );
        let open_err = |e: &dyn std::fmt::Display| TransportError::Open {
            port: port_name.clone(),
            reason: e.to_string(),
        };

        let mut builder =
            serialport::new(&port_name, config.baud_rate()).timeout(Duration::from_millis(500));
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| open_err(&e))?;
        // Many USB modems ignore commands until DTR is asserted
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            debug!("Could not purge {} buffers: {}", port_name, e);
        }
        let mut reader = port.try_clone().map_err(|e| open_err(&e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let flag = open.clone();
        let thread_port = port_name.clone();
        std::thread::Builder::new()
            .name(format!("modem-reader {}", port_name))
            .spawn(move || {
                let mut decoder = LineDecoder::new();
                let mut buf = [0u8; 512];
                let reason = 'read: loop {
                    if !flag.load(Ordering::Acquire) {
                        break None;
                    }
                    match reader.read(&mut buf) {
                        Ok(0) => break Some("end of stream".to_string()),
                        Ok(n) => {
                            for line in decoder.push(&buf[..n]) {
                                trace!("RX {}: {}", thread_port, escape_log(&line));
                                if tx.send(TransportEvent::Line(line)).is_err() {
                                    break 'read None;
                                }
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                            ) => {}
                        Err(e) => break Some(e.to_string()),
                    }
                };
                if let Some(ref err) = reason {
                    warn!("Modem reader on {} stopped: {}", thread_port, err);
                }
                flag.store(false, Ordering::Release);
                let _ = tx.send(TransportEvent::Closed(reason));
            })
            .map_err(|e| open_err(&e))?;

        Ok(ModemLink {
            transport: ModemTransport::with_flag(port_name, Box::new(port), open),
            lines: rx,
        })
    }

    #[cfg(not(feature = "serial"))]
    pub async fn open(config: &crate::config::GatewayConfig) -> Result<ModemLink, TransportError> {
        Err(TransportError::Open {
            port: config.port().to_string(),
            reason: "serial support not compiled in".to_string(),
        })
    }
}

/// Serial ports visible to the OS, as `(name, description)` pairs.
#[cfg(feature = "serial")]
pub fn list_ports() -> Vec<(String, String)> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let desc = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => format!(
                        "USB {:04x}:{:04x} {}",
                        info.vid,
                        info.pid,
                        info.product.unwrap_or_default()
                    ),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => "unknown".to_string(),
                };
                (p.port_name, desc)
            })
            .collect(),
        Err(e) => {
            warn!("Could not enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(feature = "serial"))]
pub fn list_ports() -> Vec<(String, String)> {
    Vec::new()
}

/// First USB serial port, the usual attachment for a cellular dongle.
pub fn detect_port() -> Option<String> {
    #[cfg(feature = "serial")]
    {
        serialport::available_ports()
            .ok()?
            .into_iter()
            .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
            .map(|p| p.port_name)
    }
    #[cfg(not(feature = "serial"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_lines_and_skips_blanks() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"\r\n+CSQ: 17").is_empty());
        assert_eq!(dec.push(b",99\r\n\r\nOK\r\n"), vec!["+CSQ: 17,99", "OK"]);
    }

    #[test]
    fn emits_unterminated_prompt() {
        let mut dec = LineDecoder::new();
        assert_eq!(dec.push(b"\r\n> "), vec![">"]);
        assert_eq!(dec.push(b"\r\n+CMGS: 4\r\n"), vec!["+CMGS: 4"]);
    }

    #[test]
    fn drops_oversized_garbage() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(&[b'x'; MAX_LINE_BYTES + 1]).is_empty());
        assert_eq!(dec.push(b"OK\r\n"), vec!["OK"]);
    }

    struct FailingWriter;
    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_closes_link() {
        let transport = ModemTransport::new("test", Box::new(FailingWriter));
        assert!(transport.is_open());
        assert!(matches!(transport.write("AT\r\n"), Err(TransportError::Write(_))));
        assert!(!transport.is_open());
        assert!(matches!(transport.write("AT\r\n"), Err(TransportError::Closed)));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let transport = ModemTransport::new("test", Box::new(Vec::<u8>::new()));
        transport.write("AT\r\n").unwrap();
        transport.close();
        assert!(matches!(transport.write("AT\r\n"), Err(TransportError::Closed)));
    }
}
