//! ServiceInfo streaming: chunking and unchunking pipes.
//!
//! Logical ServiceInfo values can be arbitrarily large; the transport
//! limits each message to a negotiated MTU. Two pipe pairs shape this:
//!
//! - **chunk-out** (producer side): a writer supplies logical
//!   `module:message` values through [`ServiceInfoProducer`]; a
//!   [`ChunkReader`] hands out MTU-bounded [`ServiceInfoKv`] frames. A
//!   logical key is never split across frames; a value is continued in
//!   successive frames sharing the key.
//! - **chunk-in** (consumer side): a [`ChunkWriter`] accepts frames; an
//!   [`UnchunkReader`] reassembles one byte stream per logical value.
//!
//! Pipes are single-producer/single-consumer. The internal buffer is a
//! mutex-and-condvar-protected queue with a byte bound; a slow reader
//! blocks the writer. [`ServiceInfoProducer::force_new_message`] makes the
//! next [`ChunkReader::read_chunk`] report [`ServiceInfoError::SizeTooSmall`]
//! once, forcing the assembler to start a fresh message.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Default pipe buffer bound in bytes.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Smallest useful value budget per frame; below this the reader reports
/// [`ServiceInfoError::SizeTooSmall`].
pub const MIN_CHUNK_VALUE: usize = 24;

/// Streaming errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceInfoError {
    /// The MTU budget cannot fit a useful chunk for the pending key, or a
    /// forced message boundary was reached.
    #[error("not enough size for chunk")]
    SizeTooSmall,

    /// The other end of the pipe is gone.
    #[error("service info pipe closed")]
    Closed,

    /// The producer aborted with an error.
    #[error("service info producer failed: {0}")]
    Producer(String),
}

/// One MTU-bounded frame: `[key, value]` where the value bytes may be a
/// partial slice of a logical value's encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfoKv {
    /// `module:message` key.
    pub key: String,
    /// Raw value bytes for this frame.
    pub value: Vec<u8>,
}

impl Serialize for ServiceInfoKv {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.key, serde_bytes::Bytes::new(&self.value)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServiceInfoKv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (key, value): (String, serde_bytes::ByteBuf) =
            Deserialize::deserialize(deserializer)?;
        if !key.contains(':') {
            return Err(D::Error::custom("service info key missing module prefix"));
        }
        Ok(Self {
            key,
            value: value.into_vec(),
        })
    }
}

/// Join module and message names into a wire key.
#[must_use]
pub fn service_info_key(module: &str, message: &str) -> String {
    format!("{module}:{message}")
}

struct Segment {
    key: String,
    key_encoded: Vec<u8>,
    data: VecDeque<u8>,
    closed: bool,
    forced: bool,
}

impl Segment {
    fn new(key: String) -> Self {
        // Canonical tstr encoding of the key.
        let key_encoded =
            fdo_cbor::to_canonical_cbor(&key).unwrap_or_else(|_| vec![0x60]);
        Self {
            key,
            key_encoded,
            data: VecDeque::new(),
            closed: false,
            forced: false,
        }
    }

    fn forced_boundary() -> Self {
        Self {
            key: String::new(),
            key_encoded: Vec::new(),
            data: VecDeque::new(),
            closed: true,
            forced: true,
        }
    }
}

struct Shared {
    segments: VecDeque<Segment>,
    producer_done: bool,
    consumer_gone: bool,
    error: Option<String>,
    buffered: usize,
    capacity: usize,
    total_written: usize,
}

struct Pipe {
    shared: Mutex<Shared>,
    cond: Condvar,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                segments: VecDeque::new(),
                producer_done: false,
                consumer_gone: false,
                error: None,
                buffered: 0,
                capacity: capacity.max(1),
                total_written: 0,
            }),
            cond: Condvar::new(),
        })
    }
}

/// Producer half of a pipe: writes logical ServiceInfo values.
pub struct ServiceInfoProducer {
    pipe: Arc<Pipe>,
}

impl ServiceInfoProducer {
    /// Start the next logical value for `module:message`. Must be called
    /// before any [`Self::write`].
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::Closed`] after close or consumer drop.
    pub fn next_service_info(&self, module: &str, message: &str) -> Result<(), ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        if shared.producer_done || shared.consumer_gone {
            return Err(ServiceInfoError::Closed);
        }
        if let Some(last) = shared.segments.back_mut() {
            last.closed = true;
        }
        shared
            .segments
            .push_back(Segment::new(service_info_key(module, message)));
        self.pipe.cond.notify_all();
        Ok(())
    }

    /// Append raw bytes to the current logical value, blocking while the
    /// buffer is at capacity.
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::Closed`] if no value is open or the
    /// consumer is gone.
    pub fn write(&self, bytes: &[u8]) -> Result<(), ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        let mut written = 0;
        while written < bytes.len() {
            if shared.producer_done || shared.consumer_gone {
                return Err(ServiceInfoError::Closed);
            }
            match shared.segments.back() {
                Some(last) if !last.closed => {}
                _ => return Err(ServiceInfoError::Closed),
            }
            if shared.buffered >= shared.capacity {
                self.pipe.cond.wait(&mut shared);
                continue;
            }
            let room = shared.capacity - shared.buffered;
            let n = room.min(bytes.len() - written);
            if let Some(last) = shared.segments.back_mut() {
                last.data.extend(&bytes[written..written + n]);
            }
            shared.buffered += n;
            shared.total_written += n;
            written += n;
            self.pipe.cond.notify_all();
        }
        Ok(())
    }

    /// Total bytes written through this producer so far. Used by message
    /// assemblers to decide when enough is queued to fill a frame.
    #[must_use]
    pub fn total_written(&self) -> usize {
        self.pipe.shared.lock().total_written
    }

    /// Canonically encode and append one CBOR value.
    ///
    /// # Errors
    /// See [`Self::write`]; additionally fails on unencodable values.
    pub fn write_value<T: Serialize>(&self, value: &T) -> Result<(), ServiceInfoError> {
        let bytes = fdo_cbor::to_canonical_cbor(value)
            .map_err(|e| ServiceInfoError::Producer(e.to_string()))?;
        self.write(&bytes)
    }

    /// Close the current message frame: the next chunk read reports
    /// [`ServiceInfoError::SizeTooSmall`] once, so the assembler starts a
    /// fresh message with the full MTU available.
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::Closed`] after close.
    pub fn force_new_message(&self) -> Result<(), ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        if shared.producer_done {
            return Err(ServiceInfoError::Closed);
        }
        if let Some(last) = shared.segments.back_mut() {
            last.closed = true;
        }
        shared.segments.push_back(Segment::forced_boundary());
        self.pipe.cond.notify_all();
        Ok(())
    }

    /// Finish the stream. Idempotent.
    pub fn close(&self) {
        let mut shared = self.pipe.shared.lock();
        shared.producer_done = true;
        if let Some(last) = shared.segments.back_mut() {
            last.closed = true;
        }
        self.pipe.cond.notify_all();
    }

    /// Abort the stream; the consumer observes the error.
    pub fn close_with_error(&self, message: impl Into<String>) {
        let mut shared = self.pipe.shared.lock();
        shared.error = Some(message.into());
        shared.producer_done = true;
        self.pipe.cond.notify_all();
    }
}

impl Drop for ServiceInfoProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half of the chunk-out pipe: emits MTU-bounded frames.
pub struct ChunkReader {
    pipe: Arc<Pipe>,
}

impl ChunkReader {
    /// Read the next frame with at most `size` encoded bytes.
    ///
    /// Returns `Ok(None)` when the producer has closed and everything is
    /// drained. A frame is filled to the budget unless its logical value
    /// ends first; the key is never split.
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::SizeTooSmall`] when the budget cannot
    /// fit a useful chunk (or a forced boundary is pending), and
    /// [`ServiceInfoError::Producer`] if the producer aborted.
    pub fn read_chunk(&self, size: u16) -> Result<Option<ServiceInfoKv>, ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        let mut value: Vec<u8> = Vec::new();
        let mut key = String::new();
        let mut budget = 0usize;

        loop {
            if let Some(err) = &shared.error {
                return Err(ServiceInfoError::Producer(err.clone()));
            }

            let Some(front) = shared.segments.front() else {
                if shared.producer_done {
                    return Ok(None);
                }
                self.pipe.cond.wait(&mut shared);
                continue;
            };

            if front.forced {
                shared.segments.pop_front();
                return Err(ServiceInfoError::SizeTooSmall);
            }

            if value.is_empty() {
                // Reserve: array header, encoded key, value header, one
                // length byte, and a second one for budgets past 255.
                let mut overhead = 1 + front.key_encoded.len() + 2;
                if usize::from(size) > overhead + 256 {
                    overhead += 1;
                }
                let Some(room) = usize::from(size).checked_sub(overhead) else {
                    return Err(ServiceInfoError::SizeTooSmall);
                };
                if room < MIN_CHUNK_VALUE {
                    return Err(ServiceInfoError::SizeTooSmall);
                }
                budget = room;
                key = front.key.clone();
            }

            let (n, segment_done) = {
                let Some(front) = shared.segments.front_mut() else {
                    continue;
                };
                let n = (budget - value.len()).min(front.data.len());
                value.extend(front.data.drain(..n));
                (n, front.closed && front.data.is_empty())
            };
            shared.buffered -= n;
            if n > 0 {
                self.pipe.cond.notify_all();
            }

            if value.len() == budget {
                return Ok(Some(ServiceInfoKv { key, value }));
            }

            if segment_done {
                shared.segments.pop_front();
                if value.is_empty() {
                    continue;
                }
                return Ok(Some(ServiceInfoKv { key, value }));
            }

            self.pipe.cond.wait(&mut shared);
        }
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        let mut shared = self.pipe.shared.lock();
        shared.consumer_gone = true;
        self.pipe.cond.notify_all();
    }
}

/// Create a chunk-out pipe: producer writes logical values, reader emits
/// MTU-bounded frames.
#[must_use]
pub fn new_chunk_out_pipe(capacity: usize) -> (ChunkReader, ServiceInfoProducer) {
    let pipe = Pipe::new(capacity);
    (
        ChunkReader { pipe: pipe.clone() },
        ServiceInfoProducer { pipe },
    )
}

/// Frame-level writer half of the chunk-in pipe.
pub struct ChunkWriter {
    pipe: Arc<Pipe>,
}

impl ChunkWriter {
    /// Append one received frame. Consecutive frames sharing a key extend
    /// the same logical value; a key change starts a new one.
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::Closed`] after close or reader drop.
    pub fn write_chunk(&self, kv: &ServiceInfoKv) -> Result<(), ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        if shared.producer_done || shared.consumer_gone {
            return Err(ServiceInfoError::Closed);
        }

        let start_new = match shared.segments.back() {
            Some(last) if !last.closed => last.key != kv.key,
            _ => true,
        };
        if start_new {
            if let Some(last) = shared.segments.back_mut() {
                last.closed = true;
            }
            shared.segments.push_back(Segment::new(kv.key.clone()));
        }

        let mut written = 0;
        while written < kv.value.len() {
            if shared.consumer_gone {
                return Err(ServiceInfoError::Closed);
            }
            if shared.buffered >= shared.capacity {
                self.pipe.cond.wait(&mut shared);
                continue;
            }
            let room = shared.capacity - shared.buffered;
            let n = room.min(kv.value.len() - written);
            if let Some(last) = shared.segments.back_mut() {
                last.data.extend(&kv.value[written..written + n]);
            }
            shared.buffered += n;
            written += n;
            self.pipe.cond.notify_all();
        }
        Ok(())
    }

    /// Finish the stream. Idempotent.
    pub fn close(&self) {
        let mut shared = self.pipe.shared.lock();
        shared.producer_done = true;
        if let Some(last) = shared.segments.back_mut() {
            last.closed = true;
        }
        self.pipe.cond.notify_all();
    }

    /// Abort the stream; the reader observes the error.
    pub fn close_with_error(&self, message: impl Into<String>) {
        let mut shared = self.pipe.shared.lock();
        shared.error = Some(message.into());
        shared.producer_done = true;
        self.pipe.cond.notify_all();
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Logical-value reader half of the chunk-in pipe.
pub struct UnchunkReader {
    pipe: Arc<Pipe>,
}

impl UnchunkReader {
    /// Reassemble the next logical value, blocking until it is complete.
    ///
    /// Returns `Ok(None)` at end of stream. The internal buffer drains as
    /// the value arrives, so values larger than the pipe capacity flow
    /// through without stalling the writer permanently.
    ///
    /// # Errors
    /// Returns [`ServiceInfoError::Producer`] if the writer aborted.
    pub fn next_service_info(&self) -> Result<Option<(String, Vec<u8>)>, ServiceInfoError> {
        let mut shared = self.pipe.shared.lock();
        let mut value: Vec<u8> = Vec::new();

        loop {
            if let Some(err) = &shared.error {
                return Err(ServiceInfoError::Producer(err.clone()));
            }

            let (n, finished_key) = {
                let Some(front) = shared.segments.front_mut() else {
                    if shared.producer_done {
                        return Ok(None);
                    }
                    self.pipe.cond.wait(&mut shared);
                    continue;
                };
                let n = front.data.len();
                value.extend(front.data.drain(..));
                let finished = front.closed.then(|| front.key.clone());
                (n, finished)
            };
            shared.buffered -= n;
            if n > 0 {
                self.pipe.cond.notify_all();
            }

            if let Some(key) = finished_key {
                shared.segments.pop_front();
                return Ok(Some((key, value)));
            }

            self.pipe.cond.wait(&mut shared);
        }
    }
}

impl Drop for UnchunkReader {
    fn drop(&mut self) {
        let mut shared = self.pipe.shared.lock();
        shared.consumer_gone = true;
        self.pipe.cond.notify_all();
    }
}

/// Create a chunk-in pipe: writer accepts frames, reader yields
/// reassembled logical values.
#[must_use]
pub fn new_chunk_in_pipe(capacity: usize) -> (UnchunkReader, ChunkWriter) {
    let pipe = Pipe::new(capacity);
    (
        UnchunkReader { pipe: pipe.clone() },
        ChunkWriter { pipe },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_small_value_is_one_chunk() {
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        producer.next_service_info("devmod", "os").unwrap();
        producer.write_value(&"Linux").unwrap();
        producer.close();

        let kv = reader.read_chunk(1300).unwrap().unwrap();
        assert_eq!(kv.key, "devmod:os");
        assert_eq!(kv.value, fdo_cbor::to_canonical_cbor(&"Linux").unwrap());
        assert!(reader.read_chunk(1300).unwrap().is_none());
    }

    #[test]
    fn large_value_splits_across_frames_with_same_key() {
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        let payload = vec![0xAA_u8; 500];
        producer.next_service_info("fdo.download", "data").unwrap();
        producer.write(&payload).unwrap();
        producer.close();

        let mut frames = Vec::new();
        while let Some(kv) = reader.read_chunk(200).unwrap() {
            let encoded = fdo_cbor::to_canonical_cbor(&kv).unwrap();
            assert!(encoded.len() <= 200, "frame exceeds mtu: {}", encoded.len());
            assert_eq!(kv.key, "fdo.download:data");
            frames.push(kv);
        }
        assert!(frames.len() >= 3);
        let reassembled: Vec<u8> = frames.into_iter().flat_map(|kv| kv.value).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn mtu_of_key_plus_seven_is_too_small() {
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        producer.next_service_info("devmod", "modules").unwrap();
        producer.write(&[0u8; 64]).unwrap();

        let key_encoded = fdo_cbor::to_canonical_cbor(&"devmod:modules").unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let mtu = (key_encoded.len() + 7) as u16;
        assert_eq!(
            reader.read_chunk(mtu),
            Err(ServiceInfoError::SizeTooSmall)
        );
        // A sane MTU still works afterwards; nothing was consumed.
        producer.close();
        let kv = reader.read_chunk(256).unwrap().unwrap();
        assert_eq!(kv.value.len(), 64);
    }

    #[test]
    fn force_new_message_reports_size_too_small_once() {
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        producer.next_service_info("devmod", "nummodules").unwrap();
        producer.write_value(&1u8).unwrap();
        producer.force_new_message().unwrap();
        producer.next_service_info("devmod", "modules").unwrap();
        producer.write_value(&vec![0u8, 1]).unwrap();
        producer.close();

        let first = reader.read_chunk(1300).unwrap().unwrap();
        assert_eq!(first.key, "devmod:nummodules");
        assert_eq!(
            reader.read_chunk(1300),
            Err(ServiceInfoError::SizeTooSmall)
        );
        let second = reader.read_chunk(1300).unwrap().unwrap();
        assert_eq!(second.key, "devmod:modules");
        assert!(reader.read_chunk(1300).unwrap().is_none());
    }

    #[test]
    fn producer_error_reaches_reader() {
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        producer.next_service_info("devmod", "os").unwrap();
        producer.close_with_error("module failed");
        assert!(matches!(
            reader.read_chunk(1300),
            Err(ServiceInfoError::Producer(_))
        ));
    }

    #[test]
    fn chunk_in_reassembles_consecutive_frames() {
        let (reader, writer) = new_chunk_in_pipe(DEFAULT_PIPE_CAPACITY);
        writer
            .write_chunk(&ServiceInfoKv {
                key: "fdo.download:data".into(),
                value: vec![1, 2, 3],
            })
            .unwrap();
        writer
            .write_chunk(&ServiceInfoKv {
                key: "fdo.download:data".into(),
                value: vec![4, 5],
            })
            .unwrap();
        writer
            .write_chunk(&ServiceInfoKv {
                key: "fdo.download:done".into(),
                value: vec![9],
            })
            .unwrap();
        writer.close();

        let (key, value) = reader.next_service_info().unwrap().unwrap();
        assert_eq!(key, "fdo.download:data");
        assert_eq!(value, vec![1, 2, 3, 4, 5]);
        let (key, value) = reader.next_service_info().unwrap().unwrap();
        assert_eq!(key, "fdo.download:done");
        assert_eq!(value, vec![9]);
        assert!(reader.next_service_info().unwrap().is_none());
    }

    #[test]
    fn backpressure_blocks_writer_until_reader_drains() {
        let (reader, producer) = new_chunk_out_pipe(64);
        producer.next_service_info("fdo.download", "data").unwrap();

        let writer_thread = std::thread::spawn(move || {
            producer.write(&vec![0x55u8; 1024]).unwrap();
            producer.close();
        });

        let mut total = 0;
        while let Some(kv) = reader.read_chunk(128).unwrap() {
            total += kv.value.len();
        }
        assert_eq!(total, 1024);
        writer_thread.join().unwrap();
    }

    #[test]
    fn threaded_round_trip_through_both_pipes() {
        let kvs: Vec<(String, Vec<u8>)> = vec![
            ("devmod:active".into(), fdo_cbor::to_canonical_cbor(&true).unwrap()),
            ("devmod:os".into(), fdo_cbor::to_canonical_cbor(&"Linux").unwrap()),
            ("fdo.download:data".into(), vec![0x42; 2000]),
        ];

        let (chunk_reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        let expected = kvs.clone();
        let producer_thread = std::thread::spawn(move || {
            for (key, value) in &kvs {
                let (module, message) = key.split_once(':').unwrap();
                producer.next_service_info(module, message).unwrap();
                producer.write(value).unwrap();
            }
            producer.close();
        });

        let (unchunk_reader, chunk_writer) = new_chunk_in_pipe(DEFAULT_PIPE_CAPACITY);
        let relay_thread = std::thread::spawn(move || {
            loop {
                match chunk_reader.read_chunk(180) {
                    Ok(Some(kv)) => chunk_writer.write_chunk(&kv).unwrap(),
                    Ok(None) => break,
                    Err(ServiceInfoError::SizeTooSmall) => continue,
                    Err(e) => panic!("relay failed: {e}"),
                }
            }
            chunk_writer.close();
        });

        let mut received = Vec::new();
        while let Some((key, value)) = unchunk_reader.next_service_info().unwrap() {
            received.push((key, value));
        }

        producer_thread.join().unwrap();
        relay_thread.join().unwrap();
        assert_eq!(received, expected);
    }
}
