//! Control and data connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::ServerAddress;
use crate::error::{FtpError, Result};
use crate::reply::{read_reply, Reply};

/// Socket settings shared by control and data connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for a single read or write in milliseconds.
    pub io_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY on control connections.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            io_timeout_ms: 60_000,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

async fn connect_stream(addr: SocketAddr, config: &ConnectionConfig) -> Result<TcpStream> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(FtpError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: config.connect_timeout_ms,
        }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(FtpError::ConnectionRefused {
                addr: addr.to_string(),
            })
        }
        Ok(Err(e)) => Err(FtpError::Io(e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

async fn with_timeout<T>(
    config: &ConnectionConfig,
    peer: SocketAddr,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(config.io_timeout(), fut)
        .await
        .map_err(|_| FtpError::ConnectionTimeout {
            addr: peer.to_string(),
            timeout_ms: config.io_timeout_ms,
        })?
}

/// A long-lived control connection plus, during a transfer, its data
/// connection.
#[derive(Debug)]
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    config: ConnectionConfig,
    data: Option<DataConnection>,
}

impl ControlConnection {
    /// Connect to the first reachable address of `addr`.
    ///
    /// The server greeting is not consumed.
    pub async fn connect(addr: &ServerAddress, config: &ConnectionConfig) -> Result<Self> {
        let mut last_err = None;
        for candidate in addr.resolve().await? {
            match connect_stream(candidate, config).await {
                Ok(stream) => return Self::from_stream(stream, config.clone()),
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "control connect failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FtpError::ConnectionRefused {
            addr: addr.to_string(),
        }))
    }

    /// Wrap an established stream.
    pub fn from_stream(stream: TcpStream, config: ConnectionConfig) -> Result<Self> {
        if config.nodelay {
            stream.set_nodelay(true)?;
        }
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        debug!(%peer, "control connection established");
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
            config,
            data: None,
        })
    }

    /// Address of the server end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Socket settings this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Send one command line.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        if command.contains(['\r', '\n']) {
            return Err(FtpError::InvalidFilename {
                name: command.to_string(),
            });
        }
        if let Some(arg) = command.strip_prefix("PASS ") {
            debug!(peer = %self.peer, "--> PASS {}", "*".repeat(arg.len().min(8)));
        } else {
            debug!(peer = %self.peer, "--> {}", command);
        }
        let line = format!("{command}\r\n");
        let writer = &mut self.writer;
        with_timeout(&self.config, self.peer, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    /// Read one complete reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let reader = &mut self.reader;
        let reply = with_timeout(&self.config, self.peer, read_reply(reader)).await?;
        for line in &reply.lines {
            debug!(peer = %self.peer, "<-- {}", line);
        }
        Ok(reply)
    }

    /// Open a data connection to `addr` and attach it.
    pub async fn open_data(&mut self, addr: SocketAddr) -> Result<()> {
        let stream = connect_stream(addr, &self.config).await?;
        debug!(%addr, "data connection established");
        self.data = Some(DataConnection {
            stream,
            peer: addr,
            io_timeout_ms: self.config.io_timeout_ms,
        });
        Ok(())
    }

    /// True while a data connection is attached.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// The attached data connection.
    pub fn data_mut(&mut self) -> Option<&mut DataConnection> {
        self.data.as_mut()
    }

    /// Shut down and drop the data connection, if any.
    pub async fn close_data(&mut self) {
        if let Some(mut data) = self.data.take() {
            if let Err(e) = data.stream.shutdown().await {
                debug!(peer = %data.peer, error = %e, "data shutdown failed");
            }
        }
    }

    /// Best-effort `QUIT`.
    pub async fn quit(mut self) {
        self.close_data().await;
        if self.send_command("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }
}

/// A single-use connection carrying one transfer.
#[derive(Debug)]
pub struct DataConnection {
    stream: TcpStream,
    peer: SocketAddr,
    io_timeout_ms: u64,
}

impl DataConnection {
    fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            io_timeout_ms: self.io_timeout_ms,
            ..ConnectionConfig::default()
        }
    }

    /// Read into `buf`; 0 means the server finished sending.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let config = self.config();
        let stream = &mut self.stream;
        with_timeout(&config, self.peer, async { Ok(stream.read(buf).await?) }).await
    }

    /// Write all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let config = self.config();
        let stream = &mut self.stream;
        with_timeout(&config, self.peer, async { Ok(stream.write_all(buf).await?) }).await
    }

    /// Read until the server closes the connection.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// Port from an EPSV reply: `(|||port|)` with any delimiter character.
pub fn parse_epsv(reply: &Reply) -> Option<u16> {
    reply.lines.iter().find_map(|line| {
        let start = line.find('(')?;
        let rest = &line[start + 1..];
        let mut chars = rest.chars();
        let delim = chars.next()?;
        if chars.next()? != delim || chars.next()? != delim {
            return None;
        }
        let tail: String = chars.collect();
        let (port, after) = tail.split_once(delim)?;
        if !after.starts_with(')') {
            return None;
        }
        port.parse().ok()
    })
}

/// Address from a PASV reply: `h1,h2,h3,h4,p1,p2`, parentheses optional.
pub fn parse_pasv(reply: &Reply) -> Option<SocketAddr> {
    let text = reply.text();
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u8> = text[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .next()?
        .split(',')
        .map(|n| n.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = u16::from(numbers[4]) << 8 | u16::from(numbers[5]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
