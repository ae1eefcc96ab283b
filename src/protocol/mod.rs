//! Wire protocol for the relay
//!
//! Events travel as length-prefixed binary frames with JSON payloads.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{Decodable, Encodable};
pub use frame::{Frame, FrameCodec, FrameType};
