//! Lattice region server.
//!
//! The data-serving node of the Lattice distributed, column-oriented,
//! ordered key-value store. A cluster partitions each table into
//! contiguous key ranges (regions); every region is hosted by exactly one
//! region server at a time, under the direction of an authoritative
//! master. This crate is the region-server runtime: the master-dialog
//! control loop, region lifecycle, flush and compaction/split scheduling,
//! WAL rolling, scanner leases, and the filesystem-health watchdog.

pub mod catalog;
pub mod compactor;
pub mod config;
pub mod error;
pub mod flusher;
pub mod fs;
pub mod leases;
pub mod log_roller;
pub mod master;
pub mod messages;
pub mod queue;
pub mod region;
pub mod registry;
pub mod scanners;
pub mod server;
pub mod service;
pub mod wal;
pub mod worker;

pub use config::ServerConfig;
pub use error::RequestError;
pub use master::{InProcessMaster, MasterClient};
pub use messages::{MasterInstruction, OutboundMessage, ServerIdentity, ServerLoad};
pub use region::{BatchOp, BatchUpdate, FamilySchema, RegionDescriptor, TableSchema};
pub use server::RegionServer;
pub use service::RegionService;
