//! Native model of the script's synthetic microphone.
//!
//! Each tick of the audio graph consumes at most one queued chunk and writes
//! its decoded samples into the output block. An empty queue yields a block
//! of silence: the consumer must never see an underrun as end-of-stream.
//! A chunk longer than the block is split and its tail stays at the head of
//! the queue; a shorter one is zero-padded.

use std::collections::VecDeque;

use crate::audio::AudioChunk;

/// What a single [`SyntheticMic::process`] call wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFill {
    Silence,
    /// Samples copied from the head chunk; the rest of the block is zero.
    Audio { samples: usize },
}

#[derive(Debug)]
pub struct SyntheticMic {
    queue: VecDeque<AudioChunk>,
    /// Undelivered tail of a chunk that did not fit in one block.
    remainder: Vec<f32>,
    undecodable: u64,
}

impl Default for SyntheticMic {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMic {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            remainder: Vec::new(),
            undecodable: 0,
        }
    }

    pub fn enqueue(&mut self, chunk: AudioChunk) {
        self.queue.push_back(chunk);
    }

    /// Chunks (plus any split remainder) still waiting to be played.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(!self.remainder.is_empty())
    }

    pub fn undecodable(&self) -> u64 {
        self.undecodable
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.remainder.clear();
    }

    /// Fill one output block. Never blocks and never fails.
    pub fn process(&mut self, output: &mut [f32]) -> BlockFill {
        let samples = if self.remainder.is_empty() {
            match self.next_decodable() {
                Some(samples) => samples,
                None => {
                    output.fill(0.0);
                    return BlockFill::Silence;
                }
            }
        } else {
            std::mem::take(&mut self.remainder)
        };

        let n = samples.len().min(output.len());
        output[..n].copy_from_slice(&samples[..n]);
        output[n..].fill(0.0);
        if samples.len() > n {
            self.remainder = samples[n..].to_vec();
        }
        BlockFill::Audio { samples: n }
    }

    fn next_decodable(&mut self) -> Option<Vec<f32>> {
        while let Some(chunk) = self.queue.pop_front() {
            match chunk.to_float_samples() {
                Ok(samples) => return Some(samples),
                Err(e) => {
                    self.undecodable += 1;
                    tracing::warn!(error = %e, "Dropping undecodable playback chunk");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{pcm16_to_float, BLOCK_SIZE};

    fn chunk_of(value: i16, len: usize) -> AudioChunk {
        AudioChunk::from_samples(&vec![value; len])
    }

    #[test]
    fn empty_queue_emits_silence() {
        let mut mic = SyntheticMic::new();
        let mut block = vec![0.7f32; BLOCK_SIZE];
        assert_eq!(mic.process(&mut block), BlockFill::Silence);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn one_chunk_per_call_in_push_order() {
        let mut mic = SyntheticMic::new();
        for v in [1000i16, 2000, 3000] {
            mic.enqueue(chunk_of(v, BLOCK_SIZE));
        }
        let mut block = vec![0.0f32; BLOCK_SIZE];
        for v in [1000i16, 2000, 3000] {
            assert_eq!(
                mic.process(&mut block),
                BlockFill::Audio {
                    samples: BLOCK_SIZE
                }
            );
            assert_eq!(block[0], pcm16_to_float(v));
            assert_eq!(block[BLOCK_SIZE - 1], pcm16_to_float(v));
        }
        assert_eq!(mic.process(&mut block), BlockFill::Silence);
    }

    #[test]
    fn silence_interleaves_with_sparse_pushes() {
        let mut mic = SyntheticMic::new();
        let mut block = vec![0.0f32; BLOCK_SIZE];
        let mut fills = Vec::new();

        fills.push(mic.process(&mut block));
        mic.enqueue(chunk_of(5, 10));
        fills.push(mic.process(&mut block));
        fills.push(mic.process(&mut block));

        assert_eq!(
            fills,
            vec![
                BlockFill::Silence,
                BlockFill::Audio { samples: 10 },
                BlockFill::Silence
            ]
        );
    }

    #[test]
    fn short_chunk_is_zero_padded() {
        let mut mic = SyntheticMic::new();
        mic.enqueue(chunk_of(16384, 3));
        let mut block = vec![0.9f32; 8];
        mic.process(&mut block);
        assert!(block[..3].iter().all(|&s| s > 0.49));
        assert!(block[3..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn long_chunk_is_split_across_ticks() {
        let mut mic = SyntheticMic::new();
        mic.enqueue(chunk_of(100, BLOCK_SIZE + 10));
        mic.enqueue(chunk_of(200, 4));
        let mut block = vec![0.0f32; BLOCK_SIZE];

        assert_eq!(
            mic.process(&mut block),
            BlockFill::Audio {
                samples: BLOCK_SIZE
            }
        );
        assert_eq!(mic.pending(), 2);
        assert_eq!(mic.process(&mut block), BlockFill::Audio { samples: 10 });
        assert_eq!(block[0], pcm16_to_float(100));
        assert_eq!(mic.process(&mut block), BlockFill::Audio { samples: 4 });
        assert_eq!(block[0], pcm16_to_float(200));
    }

    #[test]
    fn undecodable_chunk_is_skipped() {
        let mut mic = SyntheticMic::new();
        mic.enqueue(AudioChunk::from_base64_unchecked("%%%"));
        mic.enqueue(chunk_of(7, 2));
        let mut block = vec![0.0f32; 4];
        assert_eq!(mic.process(&mut block), BlockFill::Audio { samples: 2 });
        assert_eq!(mic.undecodable(), 1);
    }
}
