//! Owner-side ServiceInfo modules (FSIMs).
//!
//! A module produces its logical messages incrementally through an
//! explicit cursor: each [`OwnerModule::next`] call receives the cursor
//! serialized from the session row, writes zero or more logical values,
//! and returns the updated cursor. No module state survives a request
//! outside the session row, so a restarted server resumes cleanly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use fdo_protocol::devmod::DevmodSnapshot;
use fdo_protocol::serviceinfo::ServiceInfoProducer;

use crate::error::ServerError;

/// Result of one module step.
pub struct ModuleStep {
    /// Serialized cursor to store in the session, `None` when finished.
    pub state: Option<Vec<u8>>,
    /// Whether the module has emitted everything.
    pub done: bool,
}

/// One owner ServiceInfo module.
pub trait OwnerModule: Send + Sync {
    /// The module name, e.g. `fdo.download`.
    fn name(&self) -> &str;

    /// Emit the next batch of logical values into `producer`.
    ///
    /// `state` is the cursor returned by the previous step, absent on the
    /// first call.
    ///
    /// # Errors
    /// A module error tears the TO2 session down.
    fn next(
        &self,
        state: Option<&[u8]>,
        device: &DevmodSnapshot,
        producer: &ServiceInfoProducer,
    ) -> Result<ModuleStep, ServerError>;

    /// Called once when the TO2 run completes or is torn down.
    fn cleanup(&self) {}
}

/// Cursor for [`DownloadModule`]: `[stage, offset]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DownloadCursor {
    stage: u8,
    offset: u64,
}

const STAGE_ANNOUNCE: u8 = 0;
const STAGE_DATA: u8 = 1;

/// The standard `fdo.download` module: pushes one file to the device.
pub struct DownloadModule {
    file_name: String,
    data: Vec<u8>,
    chunk_size: usize,
}

impl DownloadModule {
    /// Serve `data` to the device as `file_name`.
    #[must_use]
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            data,
            chunk_size: 1014,
        }
    }

    /// Override the per-message data slice size.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl OwnerModule for DownloadModule {
    fn name(&self) -> &str {
        "fdo.download"
    }

    fn next(
        &self,
        state: Option<&[u8]>,
        _device: &DevmodSnapshot,
        producer: &ServiceInfoProducer,
    ) -> Result<ModuleStep, ServerError> {
        let cursor: DownloadCursor = match state {
            Some(bytes) => fdo_cbor::from_cbor(bytes)
                .map_err(|e| ServerError::Internal(format!("download cursor: {e}")))?,
            None => DownloadCursor {
                stage: STAGE_ANNOUNCE,
                offset: 0,
            },
        };

        let emit = |message: &str| producer.next_service_info(self.name(), message);

        if cursor.stage == STAGE_ANNOUNCE {
            emit("active").map_err(stream_err)?;
            producer.write_value(&true).map_err(stream_err)?;

            emit("name").map_err(stream_err)?;
            producer.write_value(&self.file_name).map_err(stream_err)?;

            emit("length").map_err(stream_err)?;
            producer
                .write_value(&(self.data.len() as u64))
                .map_err(stream_err)?;

            emit("sha-384").map_err(stream_err)?;
            let digest = Sha384::digest(&self.data);
            producer
                .write_value(&serde_bytes::Bytes::new(&digest))
                .map_err(stream_err)?;

            let next = DownloadCursor {
                stage: STAGE_DATA,
                offset: 0,
            };
            return Ok(ModuleStep {
                state: Some(fdo_cbor::to_canonical_cbor(&next)?),
                done: false,
            });
        }

        let offset = usize::try_from(cursor.offset)
            .map_err(|_| ServerError::Internal("download offset overflow".into()))?;
        if offset < self.data.len() {
            let end = (offset + self.chunk_size).min(self.data.len());
            emit("data").map_err(stream_err)?;
            producer
                .write_value(&serde_bytes::Bytes::new(&self.data[offset..end]))
                .map_err(stream_err)?;

            let next = DownloadCursor {
                stage: STAGE_DATA,
                offset: end as u64,
            };
            return Ok(ModuleStep {
                state: Some(fdo_cbor::to_canonical_cbor(&next)?),
                done: false,
            });
        }

        emit("done").map_err(stream_err)?;
        producer
            .write_value(&(self.data.len() as u64))
            .map_err(stream_err)?;
        Ok(ModuleStep {
            state: None,
            done: true,
        })
    }
}

fn stream_err(err: fdo_protocol::serviceinfo::ServiceInfoError) -> ServerError {
    ServerError::Internal(format!("service info pipe: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdo_protocol::serviceinfo::{DEFAULT_PIPE_CAPACITY, new_chunk_out_pipe};

    #[test]
    fn download_module_emits_announce_data_done() {
        let module = DownloadModule::new("setup.bin", vec![0x42; 2500]).with_chunk_size(1000);
        let device = DevmodSnapshot::default();

        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);
        let mut state: Option<Vec<u8>> = None;
        loop {
            let step = module.next(state.as_deref(), &device, &producer).unwrap();
            state = step.state;
            if step.done {
                break;
            }
        }
        producer.close();

        let mut messages = Vec::new();
        while let Some(kv) = reader.read_chunk(4096).unwrap() {
            messages.push(kv.key);
        }
        assert_eq!(
            messages,
            vec![
                "fdo.download:active",
                "fdo.download:name",
                "fdo.download:length",
                "fdo.download:sha-384",
                "fdo.download:data",
                "fdo.download:data",
                "fdo.download:data",
                "fdo.download:done",
            ]
        );
    }

    #[test]
    fn cursor_survives_serialization_between_steps() {
        let module = DownloadModule::new("a", vec![1; 100]).with_chunk_size(40);
        let device = DevmodSnapshot::default();
        let (reader, producer) = new_chunk_out_pipe(DEFAULT_PIPE_CAPACITY);

        // Step once, round-trip the cursor, keep going.
        let step = module.next(None, &device, &producer).unwrap();
        let stored = step.state.unwrap();
        let restored: Vec<u8> = stored.clone();
        let mut state = Some(restored);
        let mut done = false;
        while !done {
            let step = module.next(state.as_deref(), &device, &producer).unwrap();
            state = step.state;
            done = step.done;
        }
        producer.close();

        let mut data_bytes = 0;
        while let Some(kv) = reader.read_chunk(4096).unwrap() {
            if kv.key == "fdo.download:data" {
                let chunk: serde_bytes::ByteBuf = fdo_cbor::from_cbor(&kv.value).unwrap();
                data_bytes += chunk.len();
            }
        }
        assert_eq!(data_bytes, 100);
    }
}
