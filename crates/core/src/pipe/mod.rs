//! Flow-controlled byte plumbing: the chunked socket reader and the
//! spill-to-disk pipe used for the request-body buffer and the client
//! output buffer.

mod buffered_input;
mod spill_pipe;

pub use buffered_input::BufferedInput;
pub use spill_pipe::{spill_pipe, SpillDrain, SpillWriter, DEFAULT_MEMORY_THRESHOLD};
