/// Fixed-layout frames fed to the child over its stdin.
///
/// Wire layout, repeated once per tick:
/// `[u32 LE address][u32 LE size][size bytes payload]`
///
/// The payload's first byte is the sequence counter (mod 256), the rest are
/// constant marker bytes. The child parses this layout, so the constants below
/// are part of the wire contract.
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sentinel token opening every frame.
pub const FRAME_ADDRESS: u32 = 0xface_b00b;

const PAYLOAD_LEN: usize = 4;

/// Payload length declared in the size field.
pub const PAYLOAD_SIZE: u32 = PAYLOAD_LEN as u32;

/// Constant bytes following the sequence byte in every payload.
pub const PAYLOAD_MARKER: [u8; 3] = [0xaa, 0xbb, 0xcc];

/// Total bytes on the wire for one frame.
pub const FRAME_LEN: usize = 4 + 4 + PAYLOAD_LEN;

/// The three fields of a frame, in write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    Address,
    Size,
    Payload,
}

impl std::fmt::Display for FrameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameField::Address => "address",
            FrameField::Size => "size",
            FrameField::Payload => "payload",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while writing a frame.
#[derive(Debug)]
pub enum FrameError {
    /// The stream rejected the write of one field.
    StreamWrite {
        field: FrameField,
        source: io::Error,
    },
}

impl FrameError {
    /// The field whose write failed.
    pub fn field(&self) -> FrameField {
        match self {
            FrameError::StreamWrite { field, .. } => *field,
        }
    }

    /// True when earlier fields of the frame already reached the stream.
    ///
    /// The child's parser is out of sync after a partial frame.
    pub fn is_partial(&self) -> bool {
        self.field() != FrameField::Address
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::StreamWrite { field, source } => {
                write!(f, "failed to write frame {}: {}", field, source)
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::StreamWrite { source, .. } => Some(source),
        }
    }
}

/// One frame, identified by its sequence byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    sequence: u8,
}

impl Frame {
    pub fn new(sequence: u8) -> Self {
        Self { sequence }
    }

    /// Frame for a monotonically increasing tick counter; the wire byte wraps.
    pub fn for_counter(counter: u64) -> Self {
        Self::new((counter % 256) as u8)
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn payload(&self) -> [u8; PAYLOAD_LEN] {
        let [a, b, c] = PAYLOAD_MARKER;
        [self.sequence, a, b, c]
    }

    /// Encoded fields in write order.
    pub fn fields(&self) -> [(FrameField, [u8; 4]); 3] {
        [
            (FrameField::Address, FRAME_ADDRESS.to_le_bytes()),
            (FrameField::Size, PAYLOAD_SIZE.to_le_bytes()),
            (FrameField::Payload, self.payload()),
        ]
    }

    /// The whole frame as it appears on the wire.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        for (i, (_, bytes)) in self.fields().iter().enumerate() {
            out[i * 4..(i + 1) * 4].copy_from_slice(bytes);
        }
        out
    }
}

/// Write one frame carrying `sequence` to `stream`.
///
/// Each field is written and flushed before the next one starts, so the call
/// stays suspended while the stream applies backpressure. Returns only after
/// all three fields were accepted. Nothing is retried here.
pub async fn write_frame<W>(stream: &mut W, sequence: u8) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = Frame::new(sequence);
    for (field, bytes) in frame.fields() {
        write_field(stream, &bytes)
            .await
            .map_err(|source| FrameError::StreamWrite { field, source })?;
    }
    Ok(())
}

async fn write_field<W>(stream: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingWriter;
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts one byte per call and reports `Pending` on every other poll.
    #[derive(Default)]
    struct TrickleWriter {
        written: Vec<u8>,
        ready: bool,
    }

    impl AsyncWrite for TrickleWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if !this.ready {
                this.ready = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.ready = false;
            this.written.push(buf[0]);
            Poll::Ready(Ok(1))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(
            Frame::new(8).to_bytes(),
            [0x0b, 0xb0, 0xce, 0xfa, 0x04, 0x00, 0x00, 0x00, 0x08, 0xaa, 0xbb, 0xcc]
        );
    }

    #[test]
    fn test_payload_first_byte_is_sequence() {
        for n in 0..=255u8 {
            let payload = Frame::new(n).payload();
            assert_eq!(payload[0], n);
            assert_eq!(&payload[1..], &PAYLOAD_MARKER);
        }
    }

    #[test]
    fn test_counter_wraps_modulo_256() {
        assert_eq!(Frame::for_counter(8).sequence(), 8);
        assert_eq!(Frame::for_counter(255).sequence(), 255);
        assert_eq!(Frame::for_counter(256).sequence(), 0);
        assert_eq!(Frame::for_counter(257).sequence(), 1);
        assert_eq!(Frame::for_counter(263).sequence(), 7);
    }

    #[test]
    fn test_size_field_matches_payload_length() {
        let frame = Frame::new(0);
        let [_, (_, size), (_, payload)] = frame.fields();
        assert_eq!(u32::from_le_bytes(size) as usize, payload.len());
    }

    #[tokio::test]
    async fn test_write_frame_to_vec() {
        let mut out: Vec<u8> = Vec::new();
        write_frame(&mut out, 42).await.unwrap();
        assert_eq!(out, Frame::new(42).to_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_write_frame_issues_three_writes_in_order() {
        let mut writer = RecordingWriter::new();
        let log = writer.log();
        write_frame(&mut writer, 9).await.unwrap();

        let log = log.lock().unwrap();
        let sizes: Vec<usize> = log.iter().map(|r| r.bytes.len()).collect();
        assert_eq!(sizes, vec![4, 4, 4]);
        assert_eq!(log[0].bytes, FRAME_ADDRESS.to_le_bytes());
        assert_eq!(log[1].bytes, PAYLOAD_SIZE.to_le_bytes());
        assert_eq!(log[2].bytes, vec![9, 0xaa, 0xbb, 0xcc]);
    }

    #[tokio::test]
    async fn test_write_frame_waits_out_pending_stream() {
        let mut writer = TrickleWriter::default();
        write_frame(&mut writer, 200).await.unwrap();
        assert_eq!(writer.written, Frame::new(200).to_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_address_failure_is_not_partial() {
        let mut writer = RecordingWriter::failing_on(&[0]);
        let err = write_frame(&mut writer, 1).await.unwrap_err();
        assert_eq!(err.field(), FrameField::Address);
        assert!(!err.is_partial());
        assert!(writer.log().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_size_failure_leaves_partial_frame() {
        let mut writer = RecordingWriter::failing_on(&[1]);
        let log = writer.log();
        let err = write_frame(&mut writer, 1).await.unwrap_err();

        assert_eq!(err.field(), FrameField::Size);
        assert!(err.is_partial());
        // Payload is never attempted after the size write fails.
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(err.to_string().contains("failed to write frame size"));
    }

    #[tokio::test]
    async fn test_payload_failure_keeps_io_source() {
        let mut writer = RecordingWriter::failing_on(&[2]);
        let err = write_frame(&mut writer, 1).await.unwrap_err();
        assert_eq!(err.field(), FrameField::Payload);

        let source = std::error::Error::source(&err).unwrap();
        let io_err = source.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    }
}
