//! Direct TCP transport [MS-SMB2] 2.1: a blocking socket carrying
//! length-prefixed SMB frames.

use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};

use binrw::prelude::*;

use crate::packets::binrw_util::helpers::{read_u24, write_u24};

/// The 4-byte Direct TCP frame prefix: a zero byte and a 24-bit,
/// big-endian stream length.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(big, magic(b"\x00"))]
pub struct DirectTcpHeader {
    #[br(parse_with = read_u24)]
    #[bw(write_with = write_u24)]
    pub stream_protocol_length: u32,
}

impl DirectTcpHeader {
    pub const SIZE: usize = 4;
}

/// A blocking Direct TCP transport.
///
/// Not thread-safe by itself: the worker clones it once and dedicates one
/// clone to reading and one to writing.
#[derive(Debug)]
pub struct Transport {
    connection: Option<TcpStream>,
}

impl Transport {
    pub fn new() -> Transport {
        Transport { connection: None }
    }

    /// Connects to a server at the specified address.
    pub fn connect(&mut self, address: &str) -> crate::Result<()> {
        self.connection = Some(TcpStream::connect(address)?);
        Ok(())
    }

    /// Shuts the socket down, unblocking any thread reading from a clone of
    /// this transport.
    pub fn disconnect(&self) -> crate::Result<()> {
        if let Some(connection) = &self.connection {
            // a close racing the peer's close is fine.
            let _ = connection.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    /// Sends one frame, with the Direct TCP length prefix.
    pub fn send_frame(&mut self, content: &[u8]) -> crate::Result<()> {
        let tcp = self.connection.as_mut().ok_or(crate::Error::NotConnected)?;

        let mut prefix = Cursor::new([0u8; DirectTcpHeader::SIZE]);
        DirectTcpHeader {
            stream_protocol_length: content.len().try_into().map_err(|_| {
                crate::Error::InvalidMessage("Frame too large for Direct TCP".to_string())
            })?,
        }
        .write(&mut prefix)?;

        Self::write_all(tcp, &prefix.into_inner())?;
        Self::write_all(tcp, content)?;
        Ok(())
    }

    /// Receives one frame, blocking until it is fully read.
    pub fn receive_frame(&mut self) -> crate::Result<Vec<u8>> {
        let tcp = self.connection.as_mut().ok_or(crate::Error::NotConnected)?;

        let mut prefix = [0u8; DirectTcpHeader::SIZE];
        Self::read_exact(tcp, &mut prefix)?;
        let header = DirectTcpHeader::read(&mut Cursor::new(&prefix))?;

        let mut content = vec![0u8; header.stream_protocol_length as usize];
        Self::read_exact(tcp, &mut content)?;
        Ok(content)
    }

    /// Clones the transport, sharing the same underlying socket.
    pub fn try_clone(&self) -> crate::Result<Transport> {
        Ok(Transport {
            connection: Some(
                self.connection
                    .as_ref()
                    .ok_or(crate::Error::NotConnected)?
                    .try_clone()?,
            ),
        })
    }

    fn read_exact(tcp: &mut TcpStream, buf: &mut [u8]) -> crate::Result<()> {
        tcp.read_exact(buf).map_err(Self::map_tcp_error)
    }

    fn write_all(tcp: &mut TcpStream, buf: &[u8]) -> crate::Result<()> {
        tcp.write_all(buf).map_err(Self::map_tcp_error)
    }

    /// Connection aborts and unexpected EOFs are mapped to
    /// [`crate::Error::NotConnected`].
    #[inline]
    fn map_tcp_error(e: io::Error) -> crate::Error {
        match e.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => crate::Error::NotConnected,
            _ => e.into(),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
