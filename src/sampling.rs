//! Scheduled sampling: a curriculum that gradually exposes the decoder to its
//! own predictions during training.
//!
//! Early in training the decoder is fed the teacher-forced ground truth. As
//! the step counter advances, forward calls increasingly run a preliminary
//! decode first and replace confident positions of the decoder input with the
//! mean embedding of the top-5 predicted tokens. The supervised labels used
//! by the loss are never altered.

use candle::{Result, Tensor};
use candle_nn::{ops::softmax_last_dim, Embedding, Module};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Per-forward-call decision of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    /// Single decode pass fed with ground-truth inputs.
    TeacherForced,
    /// Preliminary decode, then an authoritative pass fed with the embedding
    /// mix derived from the preliminary logits.
    FreeRunning,
}

/// Training-progress state driving the teacher-forcing schedule.
///
/// `decide` must be called exactly once per training forward call; the draw
/// sequence is deterministic for a given seed. With an unknown curriculum
/// length the ratio is pinned above any possible draw, so the decoder stays
/// teacher-forced for the whole run.
#[derive(Debug, Clone)]
pub struct ScheduledSamplingController {
    num_training_steps: Option<usize>,
    cur_training_steps: usize,
    rng: StdRng,
}

impl ScheduledSamplingController {
    pub fn new(num_training_steps: Option<usize>, seed: u64) -> Self {
        Self {
            num_training_steps,
            cur_training_steps: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn cur_training_steps(&self) -> usize {
        self.cur_training_steps
    }

    /// Fraction of remaining teacher-forced budget, or 100 when the
    /// curriculum length is unknown (always wins against a draw in [0, 1)).
    pub fn teacher_training_ratio(&self) -> f64 {
        match self.num_training_steps {
            None => 100.,
            Some(n) => (n as f64 - self.cur_training_steps as f64) / n as f64,
        }
    }

    /// Advance the schedule by one training step and pick the decoding mode
    /// for this call.
    pub fn decide(&mut self) -> SamplingDecision {
        if self.num_training_steps.is_some() {
            self.cur_training_steps += 1;
        }
        let ratio = self.teacher_training_ratio();
        let draw: f64 = self.rng.gen();
        if ratio < draw {
            SamplingDecision::FreeRunning
        } else {
            SamplingDecision::TeacherForced
        }
    }
}

pub const MIX_TOP_K: usize = 5;
pub const MIX_THRESHOLD: f64 = 0.5;

/// Confidence-gated mix of predicted-token embeddings.
///
/// For every position, take the 5 most probable tokens of `logits`. Where
/// their combined probability mass exceeds 0.5, the decoder input embedding
/// is replaced by the unweighted mean of those 5 token embeddings scaled by
/// sqrt(d_model); elsewhere the teacher-forced embedding is kept untouched.
pub fn top_k_embedding_mix(
    logits: &Tensor,
    teacher_forced: &Tensor,
    word_embeddings: &Embedding,
    d_model: usize,
) -> Result<Tensor> {
    let (_, _, vocab_size) = logits.dims3()?;
    if vocab_size < MIX_TOP_K {
        candle::bail!(
            "vocabulary of size {vocab_size} is too small for a top-{MIX_TOP_K} embedding mix"
        )
    }

    let probs = softmax_last_dim(&logits.contiguous()?)?;
    let sorted_indices = probs.arg_sort_last_dim(false)?;
    let topk_indices = sorted_indices.narrow(2, 0, MIX_TOP_K)?.contiguous()?;
    let topk_probs = probs.gather(&topk_indices, 2)?;
    let use_mix = topk_probs.sum(2)?.gt(MIX_THRESHOLD)?;

    let topk_embeds = word_embeddings.forward(&topk_indices)?;
    let mix = (topk_embeds.mean(2)? * (d_model as f64).sqrt())?;

    use_mix
        .unsqueeze(2)?
        .broadcast_as(teacher_forced.shape())?
        .where_cond(&mix, teacher_forced)
}
