//! MJPEG stream delivery: admission, round-robin dispatch, response bodies and
//! multipart framing

mod admission;
pub mod body;
mod dispatcher;
pub mod multipart;

pub use admission::Admission;
pub use body::BodySender;
pub use dispatcher::{Dispatch, DispatchWorker};
