pub mod buffer;
pub mod device;
pub mod error;

pub use buffer::{Buffer, BufferCache};
pub use device::{end_buffer_io, flush_device, BlockDevice, EndIo, FileDevice, IoDirection, MemoryDevice, RegionDevice};
pub use error::JournalError;
