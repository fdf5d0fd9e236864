//! Demultiplexer for attached container output.
//!
//! Without a TTY the runtime frames every chunk of output:
//!
//! ```text
//! ┌────────┬──────────┬──────────────────┬─────────────┐
//! │ stream │ 0, 0, 0  │ length (u32, BE) │ payload ... │
//! └────────┴──────────┴──────────────────┴─────────────┘
//!   1 byte   3 bytes     4 bytes            length bytes
//! ```
//!
//! Stream 0 (stdin, echoed) and 1 go to stdout, 2 goes to stderr.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            0 => Ok(StreamKind::Stdin),
            1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown stream type {other}"),
            )),
        }
    }
}

/// Parse one frame header into its stream and payload length.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> io::Result<(StreamKind, u32)> {
    let kind = StreamKind::from_byte(header[0])?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Ok((kind, len))
}

/// Copy framed output from `reader` to `stdout` and `stderr` until the
/// stream ends. Returns the number of payload bytes copied.
///
/// The stream may only end on a frame boundary; a truncated frame is an
/// `UnexpectedEof` error.
pub async fn demux<R, O, E>(reader: &mut R, stdout: &mut O, stderr: &mut E) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut header = [0u8; HEADER_LEN];
    loop {
        if reader.read(&mut header[..1]).await? == 0 {
            return Ok(total);
        }
        reader.read_exact(&mut header[1..]).await?;
        let (kind, len) = parse_header(&header)?;

        let mut payload = (&mut *reader).take(u64::from(len));
        let copied = match kind {
            StreamKind::Stdin | StreamKind::Stdout => {
                let n = tokio::io::copy(&mut payload, stdout).await?;
                stdout.flush().await?;
                n
            }
            StreamKind::Stderr => {
                let n = tokio::io::copy(&mut payload, stderr).await?;
                stderr.flush().await?;
                n
            }
        };
        if copied < u64::from(len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame truncated after {copied} of {len} bytes"),
            ));
        }
        total += copied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn splits_stdout_and_stderr() {
        let mut input = frame(1, b"hello ");
        input.extend(frame(2, b"oops\n"));
        input.extend(frame(1, b"world\n"));
        let (mut stdout, mut stderr) = (Vec::<u8>::new(), Vec::<u8>::new());

        let copied = demux(&mut input.as_slice(), &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(stdout, b"hello world\n");
        assert_eq!(stderr, b"oops\n");
        assert_eq!(copied, 17);
    }

    #[tokio::test]
    async fn empty_stream_copies_nothing() {
        let (mut stdout, mut stderr) = (Vec::<u8>::new(), Vec::<u8>::new());
        let copied = demux(&mut &b""[..], &mut stdout, &mut stderr)
            .await
            .unwrap();
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn large_frames_span_reads() {
        let payload = vec![b'x'; 64 * 1024];
        let input = frame(1, &payload);
        let (mut stdout, mut stderr) = (Vec::<u8>::new(), Vec::<u8>::new());

        demux(&mut input.as_slice(), &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(stdout.len(), payload.len());
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut input = frame(1, b"complete");
        input.extend(&frame(2, b"cut short")[..12]);
        let (mut stdout, mut stderr) = (Vec::<u8>::new(), Vec::<u8>::new());

        let err = demux(&mut input.as_slice(), &mut stdout, &mut stderr)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(stdout, b"complete");
    }

    #[tokio::test]
    async fn unknown_stream_type_is_rejected() {
        let input = frame(7, b"??");
        let (mut stdout, mut stderr) = (Vec::<u8>::new(), Vec::<u8>::new());

        let err = demux(&mut input.as_slice(), &mut stdout, &mut stderr)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn header_length_is_big_endian() {
        let header = [2, 0, 0, 0, 0, 0, 1, 2];
        assert_eq!(parse_header(&header).unwrap(), (StreamKind::Stderr, 258));
    }
}
