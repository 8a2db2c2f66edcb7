//! Audio primitives shared by the provider clients, the bridge and the
//! injected page script.
//!
//! ## Design
//! - [`AudioChunk`] is the unit of transport: base64-encoded PCM16 LE mono.
//!   It crosses the page boundary and the provider socket without being
//!   re-encoded; ordering is implied by arrival order.
//! - [`pcm`] holds the float <-> PCM16 conversion used on both sides of the
//!   page boundary (the script carries the same arithmetic).
//! - [`fifo`] is the keep-oldest queue behind the bridge's held audio and
//!   the provider outage buffer. The page script keeps its own copy with the
//!   same drop rule, sized by [`PRE_RELAY_CAPACITY`].

pub mod fifo;
pub mod pcm;

use base64::Engine;
use serde::{Deserialize, Serialize};

pub use fifo::{BoundedFifo, PushOutcome};
pub use pcm::{float_to_pcm16, pcm16_to_float};

/// Samples per block processed by the page's audio graphs.
pub const BLOCK_SIZE: usize = 4096;

/// Capacity of the page-side FIFO that holds captured audio until the relay
/// binding exists.
pub const PRE_RELAY_CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd byte length {0}")]
    OddLength(usize),
}

/// A base64-encoded block of linear PCM16 (little-endian) mono samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioChunk(String);

impl AudioChunk {
    /// Wrap an already-encoded payload after checking it decodes to whole
    /// PCM16 samples.
    pub fn parse(b64: impl Into<String>) -> Result<Self, AudioError> {
        let b64 = b64.into();
        let bytes = base64::engine::general_purpose::STANDARD.decode(&b64)?;
        if bytes.len() % 2 != 0 {
            return Err(AudioError::OddLength(bytes.len()));
        }
        Ok(Self(b64))
    }

    /// Wrap a payload that came from a trusted encoder (the page script)
    /// without decoding it.
    pub fn from_base64_unchecked(b64: impl Into<String>) -> Self {
        Self(b64.into())
    }

    pub fn from_pcm_bytes(bytes: &[u8]) -> Self {
        Self(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::from_pcm_bytes(&bytes)
    }

    /// A chunk of `samples` zero-valued samples.
    pub fn silence(samples: usize) -> Self {
        Self::from_pcm_bytes(&vec![0u8; samples * 2])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn to_pcm_bytes(&self) -> Result<Vec<u8>, AudioError> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.0)?)
    }

    pub fn to_samples(&self) -> Result<Vec<i16>, AudioError> {
        let bytes = self.to_pcm_bytes()?;
        if bytes.len() % 2 != 0 {
            return Err(AudioError::OddLength(bytes.len()));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn to_float_samples(&self) -> Result<Vec<f32>, AudioError> {
        Ok(self.to_samples()?.into_iter().map(pcm16_to_float).collect())
    }

    /// Number of samples, derived from the encoded length.
    pub fn sample_count(&self) -> usize {
        let padding = self.0.bytes().rev().take_while(|&b| b == b'=').count();
        (self.0.len() / 4 * 3).saturating_sub(padding) / 2
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// MIME tag for raw PCM16 at the given rate, as the providers spell it.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}
