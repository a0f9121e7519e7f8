// ABOUTME: Byte-level transport links: one open OS endpoint (TCP, UDP or serial) per adapter worker
// ABOUTME: Exposes single-read fragment semantics; an empty read means the peer closed the link

use crate::descriptor::{Descriptor, FlowControl};
use crate::error::Error;
use bytes::{Bytes, BytesMut};
use serial2_tokio::SerialPort;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Fixed transport-level open timeout.
const OPEN_TIMEOUT: Duration = Duration::from_millis(500);

/// One stream read pulls at most this many bytes into a fragment.
const STREAM_CHUNK: usize = 4096;

/// Largest possible UDP payload; one `recv` returns one datagram.
const UDP_DATAGRAM_MAX: usize = 65507;

/// An open transport endpoint, owned exclusively by one worker.
#[derive(Debug)]
pub(crate) enum Link {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Serial(SerialPort),
}

impl Link {
    /// Opens the endpoint described by `descriptor`. The descriptor must be
    /// initialized; the worker checks that before calling.
    pub(crate) async fn open(descriptor: &Descriptor) -> Result<Link, Error> {
        let endpoint = descriptor.to_string();
        let open_error = |source: io::Error| Error::Open {
            endpoint: endpoint.clone(),
            source,
        };

        match descriptor {
            Descriptor::Tcp { host, port } => {
                let port = port.ok_or_else(|| {
                    Error::Configuration(format!("no port set for {endpoint}"))
                })?;
                let stream = tokio::time::timeout(
                    OPEN_TIMEOUT,
                    TcpStream::connect((host.as_str(), port)),
                )
                .await
                .map_err(|_| {
                    open_error(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                })?
                .map_err(open_error)?;
                stream.set_nodelay(true).map_err(open_error)?;
                Ok(Link::Tcp(stream))
            }
            Descriptor::Udp { host, port } => {
                let port = port.ok_or_else(|| {
                    Error::Configuration(format!("no port set for {endpoint}"))
                })?;
                let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(open_error)?;
                // Connecting filters inbound datagrams to the peer and lets
                // send errors surface on write.
                socket
                    .connect((host.as_str(), port))
                    .await
                    .map_err(open_error)?;
                Ok(Link::Udp(socket))
            }
            Descriptor::Serial {
                path,
                baud_rate,
                flow_control,
            } => {
                let baud = baud_rate.ok_or_else(|| {
                    Error::Configuration(format!("no baud rate set for {endpoint}"))
                })?;
                let flow = match flow_control {
                    FlowControl::None => serial2_tokio::FlowControl::None,
                    FlowControl::RtsCts => serial2_tokio::FlowControl::RtsCts,
                };
                let port = SerialPort::open(path, move |mut settings: serial2_tokio::Settings| {
                    settings.set_raw();
                    settings.set_baud_rate(baud)?;
                    settings.set_flow_control(flow);
                    Ok(settings)
                })
                .map_err(open_error)?;
                Ok(Link::Serial(port))
            }
        }
    }

    /// Performs a single OS read and returns the bytes as one fragment
    /// payload. An empty result means the peer closed the endpoint.
    pub(crate) async fn read_chunk(&mut self) -> io::Result<Bytes> {
        match self {
            Link::Tcp(stream) => {
                let mut buf = BytesMut::with_capacity(STREAM_CHUNK);
                stream.read_buf(&mut buf).await?;
                Ok(buf.freeze())
            }
            Link::Udp(socket) => {
                let mut buf = BytesMut::with_capacity(UDP_DATAGRAM_MAX);
                let received = socket.recv_buf(&mut buf).await?;
                if received == UDP_DATAGRAM_MAX {
                    tracing::warn!(
                        "inbound UDP datagram filled the {UDP_DATAGRAM_MAX}-byte buffer; data may have been lost"
                    );
                }
                Ok(buf.freeze())
            }
            Link::Serial(port) => {
                let mut buf = BytesMut::with_capacity(STREAM_CHUNK);
                port.read_buf(&mut buf).await?;
                Ok(buf.freeze())
            }
        }
    }

    /// Writes the whole buffer to the endpoint.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Link::Tcp(stream) => stream.write_all(data).await,
            Link::Udp(socket) => {
                let sent = socket.send(data).await?;
                if sent < data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "datagram was truncated on send",
                    ));
                }
                Ok(())
            }
            Link::Serial(port) => port.write_all(data).await,
        }
    }
}
