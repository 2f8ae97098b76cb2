//! Event sets over the Linux `perf_event_open(2)` syscall.
//!
//! A set of hardware counters is scheduled as one kernel group: the
//! first event leads, the rest follow it, and the whole group starts
//! and stops on the leader's fd. The crate handles the parts that make
//! this fiddly in practice: open ordering with rollback when a counter
//! will not schedule, kernel-version-aware read formats, scaled reads
//! for multiplexed sets, and signal-driven overflow and profiling
//! through the perf mmap ring.
//!
//! ```no_run
//! use perf_eventset::{Backend, PerfEvent, GENERALIZED_EVENTS};
//!
//! fn main() -> perf_eventset::Result<()> {
//!     let backend = PerfEvent::new()?;
//!     let (mut ctx, mut set) = backend.new_set();
//!
//!     backend.update_control_state(
//!         &mut ctx,
//!         &mut set,
//!         &GENERALIZED_EVENTS,
//!         &["instructions", "cycles"],
//!     )?;
//!
//!     backend.start(&mut ctx, &mut set)?;
//!     // ... the workload under measurement ...
//!     backend.stop(&mut ctx, &mut set)?;
//!
//!     let counts = backend.read(&ctx, &mut set)?.to_vec();
//!     println!("instructions: {}, cycles: {}", counts[0], counts[1]);
//!     Ok(())
//! }
//! ```

pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod ffi;
pub mod sample;
pub mod set;

pub use component::{Backend, Component, PerfEvent};
pub use config::{Domain, Granularity, KernelInfo};
pub use error::{PerfError, Result};
pub use event::{EventTable, NativeEvent, GENERALIZED_EVENTS};
pub use sample::{OverflowSink, Record};
pub use set::{Context, EventSet, SetOption};
