//! Receive-side pipeline
//!
//! Packets flow: classification -> statistics -> [`Framer`] (per-frame
//! [`FrameBuffer`]s) -> playout decisions in [`FrameReceiver`]. Missing
//! packets surface as NACKs through the feedback builder.

mod feedback;
mod frame_buffer;
mod frame_receiver;
mod framer;
mod stats;

pub use feedback::FeedbackBuilder;
pub use frame_buffer::FrameBuffer;
pub use frame_receiver::{EmitOutcome, FrameReceiver};
pub use framer::{Framer, InsertResult, ReleasableFrame};
pub use stats::ReceiverStats;
