//! An in-process data distributor for EPICS-style PV monitors.
//!
//! When several clients monitor the same PV they normally all receive every
//! update. A *data distributor* sits between a record and its monitors and
//! arbitrates instead: consumers subscribe into named groups on a named
//! distributor, and for each update of the record only the entitled
//! consumers receive a copy — round robin between the members of a group
//! ([`DispatchMode::OnePerGroup`]) or broadcast to the whole group
//! ([`DispatchMode::AllInGroup`]), with a configurable quota of updates per
//! turn and the turn rotating between the groups of a distributor.
//!
//! Consumers opt in with a small request string of semicolon-separated
//! `key:value` pairs, for example
//! `distributorId:beamline;groupId:workers;nUpdatesPerConsumer:3`; see
//! [`DistributorRequest`] for the full set of keys.
//!
//! The crate separates:
//!
//! - The arbitration state machine in module [`distributor`]: a
//!   [`DistributorRegistry`] of named [`distributor::Distributor`]s, their
//!   consumer groups, and the per-consumer [`distributor::ConsumerFilter`]
//!   that turns the shared decision into a copy/skip instruction.
//! - The request mini-language in module [`request`].
//! - A minimal record/monitor layer in module [`records`] that drives the
//!   distributor the way a full PV server would: per-consumer copy buffers,
//!   dirty bits, and doorbell channels.
//!
//! ## Example
//!
//! ```
//! use pvadist::{DistributorRegistry, FieldValue, Record};
//!
//! let registry = DistributorRegistry::new();
//! let record = Record::new("COUNTER", &[
//!     ("value", FieldValue::Long(0)),
//!     ("timeStamp", FieldValue::Str("t0".into())),
//! ]);
//! let a = record.subscribe_distributed(&registry, "distributorId:demo;nUpdatesPerConsumer:1");
//! let b = record.subscribe_distributed(&registry, "distributorId:demo;nUpdatesPerConsumer:1");
//!
//! // Every consumer is handed the first update it observes.
//! record.post(&[("value", 1i64.into()), ("timeStamp", "t1".into())]);
//! assert!(a.take().is_some() && b.take().is_some());
//!
//! // After that, updates rotate between the two consumers.
//! record.post(&[("value", 2i64.into()), ("timeStamp", "t2".into())]);
//! assert!(a.take().is_some());
//! assert!(b.take().is_none());
//! record.post(&[("value", 3i64.into()), ("timeStamp", "t3".into())]);
//! assert!(a.take().is_none());
//! assert!(b.take().is_some());
//! ```

pub mod distributor;
pub mod records;
pub mod request;

pub use crate::distributor::{DispatchMode, DistributorRegistry};
pub use crate::records::{FieldValue, Record, Subscription};
pub use crate::request::DistributorRequest;
