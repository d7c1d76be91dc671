pub mod candle_buffer;

pub use candle_buffer::{CandleBuffer, CandleFingerprint};
