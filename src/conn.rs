use std::{io, net::SocketAddr, os::unix::io::AsRawFd, sync::Arc};
use tokio::net::TcpStream;

// Non-blocking byte-level view of the transport. `drain` and `fill` report
// would-block as `Ok(0)`; `drain` reports a remote close as `UnexpectedEof`.
pub trait Connection: Send {

    fn remote_addr(&self) -> SocketAddr;

    // Read available bytes into `buf`.
    fn drain(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    // Write as much of `buf` as the transport accepts.
    fn fill(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

// Connection over a tokio TCP socket. The stream is shared with the driver
// task, which waits for readiness on its own handle.
pub struct TcpConnection {
    stream: Arc<TcpStream>,
    addr: SocketAddr,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<(Self, Arc<TcpStream>)> {
        let addr = stream.peer_addr()?;
        let stream = Arc::new(stream);
        Ok((Self { stream: stream.clone(), addr }, stream))
    }
}

impl Connection for TcpConnection {

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn drain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.try_read(buf) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn fill(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Shut the socket down at the fd level so the driver task, which may
        // be parked in a readiness wait on its own handle, observes the close.
        nix::sys::socket::shutdown(self.stream.as_raw_fd(), nix::sys::socket::Shutdown::Both)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}
