//! Control socket wire framing
//!
//! Each message is a native-endian u64 length prefix followed by the raw
//! bytes and a terminating NUL (the length includes the NUL). The receive
//! side enforces a caller-supplied byte limit; zero means unlimited, used
//! by clients reading arbitrarily large replies from the daemon.

use std::io::{self, Read, Write};

/// Send one length-prefixed packet.
pub fn send_packet<W: Write>(w: &mut W, payload: &str) -> io::Result<()> {
    let len = payload.len() as u64 + 1;
    w.write_all(&len.to_ne_bytes())?;
    w.write_all(payload.as_bytes())?;
    w.write_all(&[0u8])?;
    w.flush()
}

/// Receive one packet. Returns None on clean EOF before a length prefix.
/// `limit` bounds the accepted payload size; 0 lifts the bound.
pub fn recv_packet<R: Read>(r: &mut R, limit: usize) -> io::Result<Option<String>> {
    let mut len_buf = [0u8; 8];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u64::from_ne_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Some(String::new()));
    }
    if limit > 0 && len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {} bytes exceeds limit {}", len, limit),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_packet(&mut a, "list paths").unwrap();
        let got = recv_packet(&mut b, 0).unwrap();
        assert_eq!(got.as_deref(), Some("list paths"));
    }

    #[test]
    fn test_empty_payload() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_packet(&mut a, "").unwrap();
        let got = recv_packet(&mut b, 0).unwrap();
        assert_eq!(got.as_deref(), Some(""));
    }

    #[test]
    fn test_eof_returns_none() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        let got = recv_packet(&mut b, 0).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_limit_enforced() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_packet(&mut a, "a longer command line").unwrap();
        let err = recv_packet(&mut b, 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_multiple_packets_in_order() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_packet(&mut a, "first").unwrap();
        send_packet(&mut a, "second").unwrap();
        assert_eq!(recv_packet(&mut b, 0).unwrap().as_deref(), Some("first"));
        assert_eq!(recv_packet(&mut b, 0).unwrap().as_deref(), Some("second"));
    }
}
