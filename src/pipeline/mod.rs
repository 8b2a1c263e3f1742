pub mod fps;
pub mod ringbuf;

pub use fps::FpsTracker;
pub use ringbuf::{BoundedFrameBuffer, BufferStats};
