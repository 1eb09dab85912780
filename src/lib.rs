pub mod annotation;
pub mod args;
pub mod batch;
pub mod compositor;
pub mod error;
pub mod ffmpeg_stream;
pub mod geometry;
pub mod logging;
pub mod model;
pub mod motion;
pub mod opencv_tracker;
pub mod record;
pub mod sam2_process;
pub mod session;
pub mod worker;

pub use error::{Error, Result};
