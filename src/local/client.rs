use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use super::{EventSource, SourcePoll, SpikeEvent};
use crate::error::SourceError;

/// Reads spike frames from an acquisition bridge over TCP.
pub struct TcpEventSource {
    stream: TcpStream,
    peer: String,
    frame: [u8; SpikeEvent::FRAME_LEN],
    filled: usize,
    current_timeout: Option<Duration>,
}

impl TcpEventSource {
    pub fn connect<A: ToSocketAddrs>(address: A) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("connected to acquisition bridge at {}", peer);
        Ok(Self::from_stream(stream, peer))
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            frame: [0u8; SpikeEvent::FRAME_LEN],
            filled: 0,
            current_timeout: None,
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // a zero read timeout is rejected by the OS
        let timeout = timeout.max(Duration::from_millis(1));
        if self.current_timeout != Some(timeout) {
            self.stream.set_read_timeout(Some(timeout))?;
            self.current_timeout = Some(timeout);
        }
        Ok(())
    }
}

impl EventSource for TcpEventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        self.set_timeout(timeout)?;

        // Partial frames stay buffered across timeouts.
        while self.filled < SpikeEvent::FRAME_LEN {
            match self.stream.read(&mut self.frame[self.filled..]) {
                Ok(0) => {
                    if self.filled > 0 {
                        debug!("bridge closed mid-frame after {} bytes", self.filled);
                    }
                    return Ok(SourcePoll::Ended);
                }
                Ok(n) => self.filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(SourcePoll::Timeout);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.filled = 0;
        Ok(SourcePoll::Event(SpikeEvent::from_frame(&self.frame)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
