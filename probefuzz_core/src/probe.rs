use crate::coverage::Address;
use log::debug;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// A single operation failed. The sample is dropped and sampling continues.
    #[error("transient probe failure: {0}")]
    Transient(String),
    /// The probe link is gone. Continuing would silently produce zero coverage.
    #[error("probe disconnected: {0}")]
    Disconnected(String),
}

impl ProbeError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProbeError::Disconnected(_))
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                ProbeError::Transient(e.to_string())
            }
            _ => ProbeError::Disconnected(e.to_string()),
        }
    }
}

/// A `TargetProbe` is the debug link into the device under test.
///
/// The sampler drives it through halt / read / resume cycles at high
/// frequency from a background thread, so every method must be cheap and
/// must return promptly (bounded by the probe's own I/O timeout).
///
/// Callers must attempt [`TargetProbe::resume`] after every
/// [`TargetProbe::halt`], whether or not the read in between succeeded.
/// A target left halted makes every following command look like a hang.
/// [`sample_once`] implements that discipline.
pub trait TargetProbe: Send + 'static {
    /// Stops the target core.
    fn halt(&mut self) -> Result<(), ProbeError>;

    /// Reads the program counter of the halted core.
    fn read_program_counter(&mut self) -> Result<Address, ProbeError>;

    /// Lets the target core run again.
    fn resume(&mut self) -> Result<(), ProbeError>;
}

/// Takes one program-counter sample. `resume` is attempted on every path.
///
/// When both the read and the resume fail, a disconnect from either wins so
/// the caller escalates it.
pub fn sample_once<P: TargetProbe + ?Sized>(probe: &mut P) -> Result<Address, ProbeError> {
    let read = probe.halt().and_then(|()| probe.read_program_counter());
    let resumed = probe.resume();
    match (read, resumed) {
        (Ok(pc), Ok(())) => Ok(pc),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(read_err), Err(resume_err)) => {
            if resume_err.is_disconnect() && !read_err.is_disconnect() {
                Err(resume_err)
            } else {
                Err(read_err)
            }
        }
    }
}

/// [`TargetProbe`] speaking the GDB remote serial protocol, as exposed by a
/// J-Link GDB server.
pub struct GdbRemoteProbe {
    stream: TcpStream,
    pc_register: u32,
}

impl GdbRemoteProbe {
    pub fn connect(address: &str, pc_register: u32, io_timeout: Duration) -> Result<Self, ProbeError> {
        let target = address
            .to_socket_addrs()
            .map_err(|e| ProbeError::Disconnected(format!("cannot resolve {address}: {e}")))?
            .next()
            .ok_or_else(|| ProbeError::Disconnected(format!("no address for {address}")))?;
        let stream = TcpStream::connect_timeout(&target, io_timeout)
            .map_err(|e| ProbeError::Disconnected(format!("connect {address}: {e}")))?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;
        debug!("Connected to GDB server at {}", address);
        Ok(Self::from_stream(stream, pc_register))
    }

    pub fn from_stream(stream: TcpStream, pc_register: u32) -> Self {
        Self { stream, pc_register }
    }

    fn read_byte(&mut self) -> Result<u8, ProbeError> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte)? {
            0 => Err(ProbeError::Disconnected("GDB server closed the connection".into())),
            _ => Ok(byte[0]),
        }
    }

    fn send_packet(&mut self, body: &str) -> Result<(), ProbeError> {
        self.stream.write_all(frame_packet(body).as_bytes())?;
        match self.read_byte()? {
            b'+' => Ok(()),
            other => Err(ProbeError::Transient(format!(
                "expected ack for {body:?}, got {:#04x}",
                other
            ))),
        }
    }

    /// Reads one `$body#cs` packet, skipping stray acks and console output.
    fn read_packet(&mut self) -> Result<String, ProbeError> {
        loop {
            while self.read_byte()? != b'$' {}
            let mut body = Vec::new();
            loop {
                match self.read_byte()? {
                    b'#' => break,
                    b => body.push(b),
                }
            }
            let checksum = [self.read_byte()?, self.read_byte()?];
            let expected = format!("{:02x}", packet_checksum(&body));
            if !expected.as_bytes().eq_ignore_ascii_case(&checksum) {
                self.stream.write_all(b"-")?;
                return Err(ProbeError::Transient("reply checksum mismatch".into()));
            }
            self.stream.write_all(b"+")?;
            if body.first() == Some(&b'O') && body.len() > 1 {
                continue;
            }
            return String::from_utf8(body)
                .map_err(|_| ProbeError::Transient("non-ascii reply".into()));
        }
    }
}

impl TargetProbe for GdbRemoteProbe {
    fn halt(&mut self) -> Result<(), ProbeError> {
        self.stream.write_all(&[0x03])?;
        let reply = self.read_packet()?;
        match reply.as_bytes().first() {
            Some(b'S') | Some(b'T') => Ok(()),
            _ => Err(ProbeError::Transient(format!("unexpected stop reply {reply:?}"))),
        }
    }

    fn read_program_counter(&mut self) -> Result<Address, ProbeError> {
        self.send_packet(&format!("p{:x}", self.pc_register))?;
        let reply = self.read_packet()?;
        decode_register(&reply)
            .ok_or_else(|| ProbeError::Transient(format!("bad register reply {reply:?}")))
    }

    fn resume(&mut self) -> Result<(), ProbeError> {
        self.send_packet("c")
    }
}

fn packet_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn frame_packet(body: &str) -> String {
    format!("${}#{:02x}", body, packet_checksum(body.as_bytes()))
}

/// Decodes a little-endian 32-bit register value from its hex transfer form.
fn decode_register(reply: &str) -> Option<Address> {
    if reply.len() < 8 || reply.starts_with('E') {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, slot) in bytes.iter_mut().enumerate() {
        *slot = u8::from_str_radix(reply.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(Address::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    struct FailingRead {
        resumes: usize,
        error: ProbeError,
    }

    impl TargetProbe for FailingRead {
        fn halt(&mut self) -> Result<(), ProbeError> {
            Ok(())
        }
        fn read_program_counter(&mut self) -> Result<Address, ProbeError> {
            Err(self.error.clone())
        }
        fn resume(&mut self) -> Result<(), ProbeError> {
            self.resumes += 1;
            Ok(())
        }
    }

    #[test]
    fn sample_once_resumes_after_failed_read() {
        let mut probe = FailingRead {
            resumes: 0,
            error: ProbeError::Transient("no reply".into()),
        };
        assert!(sample_once(&mut probe).is_err());
        assert_eq!(probe.resumes, 1, "resume must run even when the read fails");
    }

    #[test]
    fn io_errors_are_classified() {
        let timeout: ProbeError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(!timeout.is_disconnect());
        let reset: ProbeError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_disconnect());
    }

    #[test]
    fn register_reply_is_little_endian() {
        assert_eq!(decode_register("78563412"), Some(0x1234_5678));
        assert_eq!(decode_register("E01"), None);
        assert_eq!(decode_register("zz563412"), None);
    }

    #[test]
    fn packets_carry_checksum() {
        assert_eq!(frame_packet("c"), "$c#63");
        assert_eq!(frame_packet("pf"), "$pf#d6");
    }

    fn read_until(stream: &mut TcpStream, terminator: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).expect("server read") == 1 {
            out.push(byte[0]);
            if byte[0] == terminator {
                break;
            }
        }
        out
    }

    #[test]
    fn gdb_probe_samples_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut interrupt = [0u8; 1];
            conn.read_exact(&mut interrupt).expect("interrupt byte");
            assert_eq!(interrupt[0], 0x03);
            conn.write_all(frame_packet("S05").as_bytes()).expect("stop reply");
            assert_eq!(read_until(&mut conn, b'+'), b"+");

            let request = read_until(&mut conn, b'#');
            assert_eq!(request, b"$pf#");
            let mut cs = [0u8; 2];
            conn.read_exact(&mut cs).expect("checksum");
            conn.write_all(b"+").expect("ack");
            conn.write_all(frame_packet("00100008").as_bytes()).expect("register");
            assert_eq!(read_until(&mut conn, b'+'), b"+");

            let request = read_until(&mut conn, b'#');
            assert_eq!(request, b"$c#");
            conn.read_exact(&mut cs).expect("checksum");
            conn.write_all(b"+").expect("ack");
        });

        let mut probe =
            GdbRemoteProbe::connect(&addr.to_string(), 15, Duration::from_secs(2)).expect("connect");
        let pc = sample_once(&mut probe).expect("sample");
        assert_eq!(pc, 0x0800_1000);
        server.join().expect("fake server");
    }

    #[test]
    fn closed_connection_is_a_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().expect("accept");
            drop(conn);
        });
        let mut probe =
            GdbRemoteProbe::connect(&addr.to_string(), 15, Duration::from_secs(2)).expect("connect");
        server.join().expect("fake server");
        let err = probe.halt().expect_err("halt on closed socket");
        assert!(err.is_disconnect(), "got {err:?}");
    }
}
