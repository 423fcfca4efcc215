//! Loopback client for the child's text-line management socket.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::thread;

use crossbeam_channel::Receiver;

/// A connected management channel.
///
/// Inbound lines arrive on [`lines`](Self::lines), read by a dedicated
/// thread; the channel closing means the socket hit EOF or a read error.
/// Writes are synchronous and newline-terminated.
pub struct ManagementChannel {
    stream: TcpStream,
    lines: Receiver<String>,
}

impl ManagementChannel {
    /// Single connection attempt against `127.0.0.1:port`.
    pub fn dial(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        let reader = stream.try_clone()?;
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line.trim().to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { stream, lines: rx })
    }

    pub fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    /// Writes `command` followed by a newline and flushes.
    pub fn send(&mut self, command: &str) -> io::Result<()> {
        self.stream.write_all(command.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }
}

impl Drop for ManagementChannel {
    fn drop(&mut self) {
        // Unblocks the reader thread.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn reads_lines_and_writes_newline_terminated_commands() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            writer.write_all(b">INFO:management ready\r\n").unwrap();

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "state on all\n");
        });

        let mut channel = ManagementChannel::dial(port).unwrap();
        let line = channel
            .lines()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(line, ">INFO:management ready");

        channel.send("state on all").unwrap();
        server.join().unwrap();
    }

    #[test]
    fn line_channel_closes_when_the_peer_disconnects() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let channel = ManagementChannel::dial(port).unwrap();
        server.join().unwrap();
        assert!(channel
            .lines()
            .recv_timeout(Duration::from_secs(5))
            .is_err());
    }

    #[test]
    fn dial_fails_when_nothing_listens() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(ManagementChannel::dial(port).is_err());
    }
}
