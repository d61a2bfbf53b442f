//! KoBigBird-BART encoder-decoder implementation.
//!
//! A sequence-to-sequence model for long-document summarization pairing a
//! BigBird-style encoder (block-sparse attention over long inputs) with a
//! BART-style autoregressive decoder. On top of the usual encoder-decoder
//! wiring this adds:
//! - an optional additive document-type embedding on both sides,
//! - scheduled sampling during training: as training progresses, the decoder
//!   is increasingly fed a soft mixture of its own top-5 predicted token
//!   embeddings instead of the teacher-forced ground truth.
//!
//! Key characteristics:
//! - Block-sparse encoder attention with automatic fallback to dense
//!   attention for short sequences
//! - Learned positional embeddings with offset on the decoder side
//! - KV-cache for efficient incremental decoding, with beam reordering
//! - Weight sharing between encoder and decoder embedding tables
//!
//! References:
//! - [BigBird Paper](https://arxiv.org/abs/2007.14062)
//! - [BART Paper](https://arxiv.org/abs/1910.13461)
//! - [Scheduled Sampling](https://arxiv.org/abs/1506.03099)

pub mod attention;
pub mod config;
pub mod decode;
pub mod embed;
pub mod encode;
pub mod mask;
pub mod model;
pub mod sampling;

// Re-export commonly used types for convenience
pub use config::{AttentionType, BartConfig, BigBirdConfig, EncoderDecoderConfig};
pub use decode::{BartDecoder, BartDecoderLayer};
pub use encode::{BigBirdEncoder, BigBirdEncoderLayer, EncoderOutput};
pub use model::{shift_tokens_right, ForwardArgs, KoBigBirdBartModel, Seq2SeqOutput};
pub use sampling::{SamplingDecision, ScheduledSamplingController};
