//! Streaming subsystem
//!
//! The pipeline behind `/stream/{channelId}`: classify the upstream URL,
//! admit the client through the session manager, then either proxy HLS
//! directly, drive the external encoder to MPEG-TS, or hold the client
//! with keep-alive filler while a slow origin opens.

pub mod detector;
pub mod ffmpeg;
pub mod progressive;
pub mod proxy;
pub mod session_manager;

pub use detector::{DetectedFormat, FormatDetector};
pub use ffmpeg::{FfmpegCommandBuilder, FfmpegProcess};
pub use session_manager::{SessionLimits, SessionManager, StartedSession};
