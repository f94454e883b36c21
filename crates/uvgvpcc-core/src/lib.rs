//! Core library for uvgVPCCenc: the job scheduler, bitstream writer, atlas
//! and V3C Parameter Set construction, GOF muxer, and the `Encoder` public
//! API built on top of them.

pub mod annexb;
pub mod atlas;
pub mod bitstream;
pub mod encoder;
pub mod error;
pub mod model;
pub mod mux;
pub mod parameters;
pub mod scheduler;
pub mod sync;
pub mod vps;

pub use encoder::{DummyRun, Encoder, PatchGenerator, PatchPacker, VideoEncoder2d};
pub use error::{EncoderError, Result};
pub use model::{ColoredPoint, Frame, FrameMap, Gof, Patch, Point3, Rgb, V3cChunk};
pub use mux::MuxedGof;
pub use parameters::{Mode, Parameters};
pub use scheduler::{JobId, JobState, Scheduler};
pub use sync::{OutputQueue, Semaphore};
