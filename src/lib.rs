//! A virtio-fs file server for SmartNIC/DPU deployments.
//!
//! `mirrorfs` re-exports a local directory tree to guests over the
//! virtio-fs wire protocol: the DPU-side HAL delivers FUSE-encoded
//! requests, this crate translates each one into syscalls against the
//! backing tree and hands the reply back. Metadata operations complete
//! inline on the poll thread; read and write are pushed through a shared
//! io_uring so the poll thread never blocks on disk.
//!
//! The crate is organised around three pieces of state:
//!
//! - the [inode table](inode), which pins every object the guest kernel
//!   knows about behind a stable `(node-id, generation)` identity,
//! - the [dispatch surface](server), one handler per FUSE opcode,
//! - the [async engine](aio), which pairs each in-flight read/write with
//!   a parked callback record until its completion is reaped.
//!
//! The `mirrorfsd` binary wires these to a TOML [config](config) and the
//! [bring-up transport](hal); on a real DPU the vendor SDK takes the
//! transport's place and talks to [`server::MirrorFs::dispatch`]
//! directly.

#![warn(rust_2018_idioms)]

pub mod aio;
pub mod config;
pub mod dir;
pub mod hal;
pub mod inode;
pub mod ll;
pub mod pool;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError};
pub use hal::{Completion, CompletionStatus, DeviceId, Dispatch, RequestCtx};
pub use server::MirrorFs;
