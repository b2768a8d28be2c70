#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # warren
//!
//! warren is a bidirectional HTTP-over-TCP proxy fabric. Workloads inside
//! an isolated container issue ordinary HTTP/1.1 requests against a local
//! ingress; the fabric carries them over a fixed pool of pre-opened TCP
//! channels to an edge peer that holds the credentials to service them,
//! and carries the responses back.
//!
//! Two halves make up the fabric:
//!
//! - [`container`]: the peer inside the container. It hosts the local
//!   ingress, listens on one control port and `N` contiguous data ports,
//!   and allocates data channels to in-flight requests.
//! - [`edge`]: the external peer. It dials the control channel, opens data
//!   channels on demand, parses the tunneled requests, and answers them
//!   through an [object store](store::ObjectStore).
//!
//! The control channel speaks a small length-prefixed JSON protocol
//! ([`protocol`]) used only for channel allocation and liveness. Request
//! and response bytes travel on the data channels as plain HTTP/1.1.

pub use crate::error::{Error, Result};

#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Uri};

pub mod config;
pub mod container;
pub mod edge;
mod error;
mod http1;
pub mod protocol;
pub mod store;
