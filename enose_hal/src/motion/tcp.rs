//! TCP transport for the motion controller.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use super::{MotionError, MotionPort};

/// Line transport over a TCP socket.
pub struct TcpMotionPort {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpMotionPort {
    /// Connect to the controller.
    pub fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, MotionError> {
        use std::net::ToSocketAddrs;
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| MotionError::Transport(format!("resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| MotionError::Transport(format!("no address for {host}:{port}")))?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| MotionError::Transport(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| MotionError::Transport(e.to_string()))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| MotionError::Transport(e.to_string()))?,
        );
        Ok(Self { stream, reader })
    }
}

impl MotionPort for TcpMotionPort {
    fn send_line(&mut self, line: &str) -> Result<(), MotionError> {
        self.stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.write_all(b"\n"))
            .map_err(|e| MotionError::Transport(e.to_string()))
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, MotionError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| MotionError::Transport(e.to_string()))?;
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(MotionError::Transport("connection closed".to_string())),
            Ok(_) => Ok(Some(line.trim_end().to_string())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(MotionError::Transport(e.to_string())),
        }
    }
}
