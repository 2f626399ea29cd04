//! FDO server roles: the protocol responders, dispatcher, and APIs.
//!
//! One process plays one or more roles by attaching responders to a
//! [`Dispatcher`]:
//!
//! - Manufacturing: [`DiResponder`] (messages 10-13)
//! - Rendezvous: [`To0Responder`] + [`To1Responder`] (20-23, 30-33)
//! - Owner: [`To2Responder`] (60-71) plus the TO0 publish client
//!
//! The HTTP adapters in [`http`] and [`control`] are thin: all protocol
//! state lives in the `fdo-store` traits, and all message semantics live
//! in the responders.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod control;
pub mod di;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod modules;
pub mod to0;
pub mod to1;
pub mod to2;

pub use control::{ControlState, OwnerTo0Publisher, RvInfoDoc, To0Publisher, control_router};
pub use di::DiResponder;
pub use dispatch::{
    DEFAULT_CALL_DEADLINE, DispatchOutcome, Dispatcher, LocalTransport, MessageTransport,
};
pub use error::ServerError;
pub use http::{MESSAGE_TYPE_HEADER, fdo_router};
pub use modules::{DownloadModule, ModuleStep, OwnerModule};
pub use to0::{MAX_WAIT_SECONDS, OwnerTo0Client, To0Responder};
pub use to1::To1Responder;
pub use to2::{DEFAULT_MESSAGE_SIZE, To2Responder};
