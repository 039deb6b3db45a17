//! Record exchange over the pre-existing TCP connection.
//!
//! Both sides write their fixed-size record and read the peer's, using
//! full-read/full-write loops so short transfers are invisible. The record
//! travels in the native byte order of the producing host; the two ends of
//! a ring are assumed homogeneous. After the queue pairs on both sides
//! reached ready-to-send, a single byte is exchanged as a barrier so
//! neither side posts into a half-wired queue pair.
//!
//! The socket is only borrowed. Whatever happens here, the caller keeps a
//! usable TCP connection for the plain-socket fallback.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::unistd;
use tracing::debug;

/// Size of the handshake record on the wire
pub(crate) const RECORD_LEN: usize = 40;

/// The barrier byte sent after reaching ready-to-send
const BARRIER_BYTE: u8 = 0x00;

/// The addressing a peer needs to reach this endpoint: the queue pair, the
/// receive ring and the cursor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandshakeRecord {
    /// Local queue pair number
    pub(crate) qp_num: u32,
    /// Local port LID
    pub(crate) lid: u16,
    /// Remote address of the receive ring
    pub(crate) ring_addr: u64,
    /// Remote key of the receive ring
    pub(crate) ring_rkey: u32,
    /// Remote address of the cursor block
    pub(crate) cursor_addr: u64,
    /// Remote key of the cursor block
    pub(crate) cursor_rkey: u32,
}

impl HandshakeRecord {
    /// Serialize into the fixed wire layout.
    ///
    /// ```text
    /// offset size field
    ///      0    4 queue pair number
    ///      4    2 port LID
    ///      6    2 reserved
    ///      8    8 receive ring address
    ///     16    4 receive ring key
    ///     20    4 reserved
    ///     24    8 cursor block address
    ///     32    4 cursor block key
    ///     36    4 reserved
    /// ```
    pub(crate) fn to_bytes(self) -> [u8; RECORD_LEN] {
        let mut buf = [0_u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&self.qp_num.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.lid.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.ring_addr.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.ring_rkey.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.cursor_addr.to_ne_bytes());
        buf[32..36].copy_from_slice(&self.cursor_rkey.to_ne_bytes());
        buf
    }

    /// Deserialize from the fixed wire layout.
    pub(crate) fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        /// Slice a fixed-size array out of the record
        fn field<const LEN: usize>(buf: &[u8], offset: usize) -> [u8; LEN] {
            let mut out = [0_u8; LEN];
            out.copy_from_slice(&buf[offset..offset + LEN]);
            out
        }
        Self {
            qp_num: u32::from_ne_bytes(field(buf, 0)),
            lid: u16::from_ne_bytes(field(buf, 4)),
            ring_addr: u64::from_ne_bytes(field(buf, 8)),
            ring_rkey: u32::from_ne_bytes(field(buf, 16)),
            cursor_addr: u64::from_ne_bytes(field(buf, 24)),
            cursor_rkey: u32::from_ne_bytes(field(buf, 32)),
        }
    }
}

/// Write the whole buffer, repeating on short writes and `EINTR`.
fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match unistd::write(fd, buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
    Ok(())
}

/// Fill the whole buffer, repeating on short reads and `EINTR`.
fn read_exact(fd: RawFd, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match unistd::read(fd, buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
    Ok(())
}

/// Exchange records with the peer. Both sides send first and read second;
/// the records are small enough to never fill the socket buffers, so the
/// symmetric order cannot deadlock.
pub(crate) fn exchange(fd: RawFd, local: &HandshakeRecord) -> io::Result<HandshakeRecord> {
    write_all(fd, &local.to_bytes())?;
    let mut buf = [0_u8; RECORD_LEN];
    read_exact(fd, &mut buf)?;
    let remote = HandshakeRecord::from_bytes(&buf);
    debug!("handshake: local {:?}, remote {:?}", local, remote);
    Ok(remote)
}

/// Block until both sides have passed this point.
pub(crate) fn barrier(fd: RawFd) -> io::Result<()> {
    write_all(fd, &[BARRIER_BYTE])?;
    let mut buf = [0_u8; 1];
    read_exact(fd, &mut buf)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::thread;

    fn sample_record() -> HandshakeRecord {
        HandshakeRecord {
            qp_num: 0x00C0_FFEE,
            lid: 0x0102,
            ring_addr: 0x1122_3344_5566_7788,
            ring_rkey: 0xAABB_CCDD,
            cursor_addr: 0x99AA_BBCC_DDEE_FF00,
            cursor_rkey: 0x1357_9BDF,
        }
    }

    #[test]
    fn record_layout() {
        let record = sample_record();
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(bytes[0..4], record.qp_num.to_ne_bytes());
        assert_eq!(bytes[4..6], record.lid.to_ne_bytes());
        assert_eq!(bytes[6..8], [0, 0]);
        assert_eq!(bytes[8..16], record.ring_addr.to_ne_bytes());
        assert_eq!(bytes[16..20], record.ring_rkey.to_ne_bytes());
        assert_eq!(bytes[20..24], [0, 0, 0, 0]);
        assert_eq!(bytes[24..32], record.cursor_addr.to_ne_bytes());
        assert_eq!(bytes[32..36], record.cursor_rkey.to_ne_bytes());
        assert_eq!(bytes[36..40], [0, 0, 0, 0]);
        assert_eq!(HandshakeRecord::from_bytes(&bytes), record);
    }

    #[test]
    fn exchange_and_barrier_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _peer) = listener.accept().unwrap();
            let mut record = sample_record();
            record.qp_num = 7;
            let remote = exchange(stream.as_raw_fd(), &record).unwrap();
            barrier(stream.as_raw_fd()).unwrap();
            remote
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut record = sample_record();
        record.qp_num = 9;
        let remote = exchange(stream.as_raw_fd(), &record).unwrap();
        barrier(stream.as_raw_fd()).unwrap();

        assert_eq!(remote.qp_num, 7);
        assert_eq!(server.join().unwrap().qp_num, 9);
    }

    #[test]
    fn eof_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            // Accept and close immediately without answering.
            let (stream, _peer) = listener.accept().unwrap();
            drop(stream);
        });

        let stream = TcpStream::connect(addr).unwrap();
        server.join().unwrap();
        // Depending on timing this surfaces as EOF or as a reset, either
        // way the exchange must fail.
        assert!(exchange(stream.as_raw_fd(), &sample_record()).is_err());
    }
}
