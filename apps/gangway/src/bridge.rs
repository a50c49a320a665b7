//! Terminal I/O bridge between one attach stream and the exec layer.
//!
//! The gate's socket read loop pushes frames into a `BridgeInput`; the exec
//! client pulls stdin chunks from the matching `BridgeReader` and polls the
//! latest terminal geometry immediately before each blocking read, so a
//! resize takes effect on the next input round without a dedicated signal.

use gangway_proto::{ServerFrame, TerminalGeometry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client sent {0} stdin chunks in one frame")]
    TooManyChunks(usize),
    #[error("stdin chunk of {chunk} bytes exceeds the {buffer}-byte read buffer")]
    ChunkTooLarge { chunk: usize, buffer: usize },
    #[error("bridge closed")]
    Closed,
}

/// Result of pulling one stdin chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum InputRead {
    Chunk(Vec<u8>),
    /// The push side is gone or the reader was closed.
    Closed,
}

struct GeometryCell(Mutex<TerminalGeometry>);

impl GeometryCell {
    fn set(&self, geometry: TerminalGeometry) {
        *self.0.lock() = geometry;
    }

    fn get(&self) -> TerminalGeometry {
        *self.0.lock()
    }
}

pub struct TerminalBridge;

impl TerminalBridge {
    /// Build the push/pull pair for one attach. The stdin channel holds a
    /// single slot: input is never coalesced and backpressure reaches the
    /// socket loop directly.
    pub fn channel(initial: TerminalGeometry) -> (BridgeInput, BridgeReader) {
        let (chunks_tx, chunks_rx) = mpsc::channel(1);
        let geometry = Arc::new(GeometryCell(Mutex::new(initial)));
        let closed = Arc::new(AtomicBool::new(false));
        (
            BridgeInput {
                chunks: chunks_tx,
                geometry: geometry.clone(),
                closed: closed.clone(),
            },
            BridgeReader {
                chunks: chunks_rx,
                geometry,
                closed,
            },
        )
    }
}

/// Push side, owned by the socket read loop. Dropping it signals stdin
/// end-of-stream to the reader.
pub struct BridgeInput {
    chunks: mpsc::Sender<Vec<u8>>,
    geometry: Arc<GeometryCell>,
    closed: Arc<AtomicBool>,
}

impl BridgeInput {
    /// Apply one inbound frame: an optional resize and at most one stdin
    /// chunk. A frame carrying more than one chunk is a protocol violation.
    pub async fn push_frame(
        &self,
        geometry: Option<TerminalGeometry>,
        mut stdin: Vec<String>,
    ) -> Result<(), BridgeError> {
        if let Some(geometry) = geometry {
            self.geometry.set(geometry);
        }
        match stdin.len() {
            0 => Ok(()),
            1 => {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(BridgeError::Closed);
                }
                let chunk = stdin.pop().expect("length checked").into_bytes();
                self.chunks
                    .send(chunk)
                    .await
                    .map_err(|_| BridgeError::Closed)
            }
            n => Err(BridgeError::TooManyChunks(n)),
        }
    }
}

/// Pull side, handed to the exec client.
pub struct BridgeReader {
    chunks: mpsc::Receiver<Vec<u8>>,
    geometry: Arc<GeometryCell>,
    closed: Arc<AtomicBool>,
}

impl BridgeReader {
    /// Latest geometry reported by the client.
    pub fn geometry(&self) -> TerminalGeometry {
        self.geometry.get()
    }

    /// Block until one stdin chunk arrives or the stream ends.
    pub async fn read_chunk(&mut self) -> InputRead {
        if self.closed.load(Ordering::SeqCst) {
            return InputRead::Closed;
        }
        match self.chunks.recv().await {
            // A close that raced the receive discards the chunk: no delivery
            // after close, buffered or not.
            Some(_) if self.closed.load(Ordering::SeqCst) => InputRead::Closed,
            Some(chunk) => InputRead::Chunk(chunk),
            None => InputRead::Closed,
        }
    }

    /// Byte-buffer variant of `read_chunk`. Chunks are never split across
    /// reads; a chunk that does not fit the buffer is an error. Returns
    /// `None` at end-of-stream.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BridgeError> {
        match self.read_chunk().await {
            InputRead::Closed => Ok(None),
            InputRead::Chunk(chunk) if chunk.len() > buf.len() => Err(BridgeError::ChunkTooLarge {
                chunk: chunk.len(),
                buffer: buf.len(),
            }),
            InputRead::Chunk(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(Some(chunk.len()))
            }
        }
    }

    /// Idempotent: stops further delivery even if input is still buffered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Output side of the bridge: one `ServerFrame` per write, no buffering or
/// coalescing across calls.
#[derive(Clone)]
pub struct BridgeWriter {
    frames: mpsc::UnboundedSender<ServerFrame>,
}

impl BridgeWriter {
    pub fn new(frames: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { frames }
    }

    pub fn write_stdout(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.send(ServerFrame::Stdout {
            data: String::from_utf8_lossy(data).into_owned(),
        })
    }

    pub fn write_stderr(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.send(ServerFrame::Stderr {
            data: String::from_utf8_lossy(data).into_owned(),
        })
    }

    fn send(&self, frame: ServerFrame) -> Result<(), BridgeError> {
        self.frames.send(frame).map_err(|_| BridgeError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u16, height: u16) -> TerminalGeometry {
        TerminalGeometry { width, height }
    }

    #[tokio::test]
    async fn chunks_flow_through_in_order() {
        let (input, mut reader) = TerminalBridge::channel(geometry(80, 24));
        let feeder = tokio::spawn(async move {
            input.push_frame(None, vec!["ab".into()]).await.unwrap();
            input.push_frame(None, vec!["cd".into()]).await.unwrap();
        });

        assert_eq!(reader.read_chunk().await, InputRead::Chunk(b"ab".to_vec()));
        assert_eq!(reader.read_chunk().await, InputRead::Chunk(b"cd".to_vec()));
        feeder.await.unwrap();

        // Push side dropped: end of stream.
        assert_eq!(reader.read_chunk().await, InputRead::Closed);
    }

    #[tokio::test]
    async fn geometry_reflects_the_latest_update() {
        let (input, reader) = TerminalBridge::channel(geometry(80, 24));
        assert_eq!(reader.geometry(), geometry(80, 24));

        input
            .push_frame(Some(geometry(100, 30)), vec![])
            .await
            .unwrap();
        input
            .push_frame(Some(geometry(120, 40)), vec![])
            .await
            .unwrap();
        assert_eq!(reader.geometry(), geometry(120, 40));
    }

    #[tokio::test]
    async fn resize_lands_before_the_chunk_it_rides_with() {
        let (input, mut reader) = TerminalBridge::channel(geometry(80, 24));
        let feeder = tokio::spawn(async move {
            input
                .push_frame(Some(geometry(120, 40)), vec!["hi".into()])
                .await
                .unwrap();
        });

        assert_eq!(reader.read_chunk().await, InputRead::Chunk(b"hi".to_vec()));
        assert_eq!(reader.geometry(), geometry(120, 40));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn multiple_chunks_per_frame_are_rejected() {
        let (input, _reader) = TerminalBridge::channel(geometry(80, 24));
        let err = input
            .push_frame(None, vec!["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TooManyChunks(2)));
    }

    #[tokio::test]
    async fn read_into_never_splits_a_chunk() {
        let (input, mut reader) = TerminalBridge::channel(geometry(80, 24));
        let feeder = tokio::spawn(async move {
            input.push_frame(None, vec!["0123456789".into()]).await.unwrap();
        });

        let mut small = [0u8; 4];
        let err = reader.read_into(&mut small).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ChunkTooLarge {
                chunk: 10,
                buffer: 4
            }
        ));
        feeder.await.unwrap();

        drop(reader);
    }

    #[tokio::test]
    async fn read_into_copies_whole_chunks() {
        let (input, mut reader) = TerminalBridge::channel(geometry(80, 24));
        let feeder = tokio::spawn(async move {
            input.push_frame(None, vec!["hello".into()]).await.unwrap();
        });

        let mut buf = [0u8; 16];
        let n = reader.read_into(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        feeder.await.unwrap();

        assert_eq!(reader.read_into(&mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let (input, mut reader) = TerminalBridge::channel(geometry(80, 24));
        input.push_frame(None, vec!["buffered".into()]).await.unwrap();

        reader.close();
        reader.close();
        assert_eq!(reader.read_chunk().await, InputRead::Closed);

        // The push side now fails fast instead of blocking on a dead reader.
        let err = input.push_frame(None, vec!["late".into()]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }

    #[tokio::test]
    async fn writer_emits_one_frame_per_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = BridgeWriter::new(tx);
        writer.write_stdout(b"out").unwrap();
        writer.write_stderr(b"err").unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::Stdout { data } => assert_eq!(data, "out"),
            other => panic!("expected stdout frame, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Stderr { data } => assert_eq!(data, "err"),
            other => panic!("expected stderr frame, got {other:?}"),
        }
    }
}
