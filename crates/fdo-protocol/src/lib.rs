//! FDO wire messages, ownership vouchers, and ServiceInfo streaming.
//!
//! Everything the four protocol responders exchange lives here:
//!
//! - [`guid`] - device GUIDs and nonces
//! - [`error`] - the error message (type 255) and chain error reasons
//! - [`rendezvous`] - rendezvous directives and owner TO2 addresses
//! - [`voucher`] - the ownership voucher and its chain operations
//! - [`messages`] - the DI/TO0/TO1/TO2 message types
//! - [`serviceinfo`] - MTU chunking/unchunking pipes
//! - [`devmod`] - the mandatory device module

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod devmod;
pub mod error;
pub mod guid;
pub mod messages;
pub mod rendezvous;
pub mod serviceinfo;
pub mod voucher;

pub use devmod::{DEVMOD_MODULE, Devmod, DevmodModulesChunk, DevmodSnapshot};
pub use error::{ChainError, ErrorCode, ErrorMessage, MSG_ERROR};
pub use guid::{Guid, Nonce};
pub use messages::*;
pub use rendezvous::{RV_PROT_HTTP, RV_PROT_HTTPS, RvDirective, RvInfo, RvInstruction, RvTo2Addr, RvVariable};
pub use serviceinfo::{
    ChunkReader, ChunkWriter, DEFAULT_PIPE_CAPACITY, MIN_CHUNK_VALUE, ServiceInfoError,
    ServiceInfoKv, ServiceInfoProducer, UnchunkReader, new_chunk_in_pipe, new_chunk_out_pipe,
    service_info_key,
};
pub use voucher::{
    EntryPayload, OwnershipVoucher, PROTOCOL_VERSION, VoucherError, VoucherHeader,
};
