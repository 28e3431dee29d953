//! Concrete implementations of the external capabilities: streamlink for
//! liveness resolution and capture, ffmpeg/ffprobe for remux and duration
//! probing, and plain HTTP for page and thumbnail fetches.

pub mod ffmpeg;
pub mod http;
pub mod streamlink;

pub use ffmpeg::{Ffmpeg, FfprobeDuration};
pub use http::{HttpFetcher, StatusApiProbe};
pub use streamlink::Streamlink;
