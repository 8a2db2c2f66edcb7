//! voxroom: puts a real-time speech AI into a browser-based virtual office
//! as if it were a participant's microphone.
//!
//! The AI's speech is injected into the page as the microphone stream; the
//! room's audio is tapped inside the page and streamed back to the AI.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod interceptor;
pub mod page;
pub mod voice;

pub use bridge::{AudioBridge, BridgeError, SetupReport};
pub use config::Config;
pub use voice::{create_voice_client, StreamingVoiceClient, VoiceError, VoiceEvent};
