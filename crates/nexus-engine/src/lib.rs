//! # Nexus Engine
//!
//! The pipelined, back-pressured machinery that drives the domain model in `nexus-core` against
//! the cache and memory subsystems in `nexus-storage`: the per-source controller state machine
//! (spec §4.D), the SPSC byte pipe (spec §4.H/§5/§9), the chunked read scheduler (spec §4.H),
//! the writer controller (spec §4.I), and the pipeline facade that wires catalog stages together
//! (spec §4.J).

pub mod controller;
pub mod pipe;
pub mod pipeline;
pub mod scheduler;
pub mod writer;

pub use controller::SourceControllerHandle;
pub use pipe::{pipe as spsc_pipe, PipeReader, PipeWriter};
pub use pipeline::PipelineRunner;
pub use scheduler::{DataReadingGroup, ReadScheduler, ReadSlot};
pub use writer::WriterController;
