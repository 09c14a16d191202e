//! Incremental decoders for the two wire formats the core speaks: the
//! netstring-framed request header block arriving from the front-end, and
//! the CGI-style response header block arriving from the application.

mod frame_decoder;
mod response_head_decoder;

pub use frame_decoder::FrameDecoder;
pub use response_head_decoder::ResponseHeadDecoder;
