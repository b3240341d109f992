pub mod bitrate;
pub mod engine;
pub mod media_info;
pub mod window;

pub use bitrate::PerBitrateInfo;
pub use engine::{DownloadReport, Heuristics};
pub use media_info::{DownloadState, NetworkMediaInfo, USABLE_MASK_BITS};
pub use window::SlidingWindow;
