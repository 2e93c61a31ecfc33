//! Video pipeline: ingest, transcoding, viewers, recording and photos.
//!
//! ```text
//!                       ┌──▶ live transcoder ──▶ Broadcaster ──▶ viewers (WebSocket)
//! drone ──UDP──▶ VideoIngest                 └──▶ still frame ──▶ photos
//!                       └──▶ recording muxer ──▶ recordings/*.mp4
//! ```

mod broadcaster;
mod fanout;
mod hygiene;
mod ingest;
mod photo;
mod recording;
mod store;
mod supervisor;
mod transcoder;

pub use broadcaster::Broadcaster;
pub use fanout::{Delivery, FanOut, MemberId};
pub use hygiene::{PortHolder, PortInspector, SystemPortInspector, bind_video_socket};
pub use ingest::VideoIngest;
pub use photo::capture_still;
pub use recording::RecordingBranch;
pub use store::MediaStore;
pub use supervisor::StreamSupervisor;
pub use transcoder::{FfmpegLauncher, TranscoderLauncher};
