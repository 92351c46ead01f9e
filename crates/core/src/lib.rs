pub mod announce;
pub mod clock;
pub mod error;
pub mod media;
pub mod mount;
pub mod protocol;
pub mod rtcp;
pub mod rtp;
pub mod server;
pub mod session;
pub mod transport;
pub mod vod;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StreamError};
pub use media::{Block, Codec, EsCategory, EsDescriptor, PayloadFormat, resolve_format};
pub use protocol::Negotiator;
pub use rtp::{Protocol, RtpSession, SessionConfig};
pub use server::{RtspConfig, StreamId, Streamer, StreamerConfig};
pub use vod::{MediaController, VodCommand, VodServer};
