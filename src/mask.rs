//! Mask construction for block-sparse encoding and causal decoding.
//!
//! The encoder runs BigBird block-sparse attention, which operates on
//! sequences padded to a multiple of the block size and on a set of masks
//! derived from the padding mask: the blocked mask, the banded
//! local-neighbourhood mask and broadcastable from/to validity masks. The
//! decoder uses the usual additive causal + padding mask.

use candle::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module};

/// Tensors right-padded to a multiple of the block size, plus the pad length
/// needed to trim the encoder output back afterwards.
#[derive(Debug, Clone)]
pub struct PaddedInput {
    pub padding_len: usize,
    pub input_ids: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
    pub doc_type_ids: Option<Tensor>,
    pub position_ids: Option<Tensor>,
}

/// Right-pad `t` along the sequence axis with a constant id.
fn pad_ids(t: &Tensor, padding_len: usize, value: u32) -> Result<Tensor> {
    let (b_sz, _) = t.dims2()?;
    let pad = Tensor::full(value, (b_sz, padding_len), t.device())?.to_dtype(t.dtype())?;
    Tensor::cat(&[t, &pad], 1)
}

/// Pad a batch so its sequence length becomes a multiple of `block_size`.
///
/// Token ids are padded with `pad_token_id`, the attention mask with 0 (no
/// attention on the padding), token-type and doc-type ids with 0, and input
/// embeddings with the embedding of `pad_token_id`. Exactly one of
/// `input_ids`/`inputs_embeds` must be provided.
#[allow(clippy::too_many_arguments)]
pub fn pad_to_block_size(
    input_ids: Option<&Tensor>,
    inputs_embeds: Option<&Tensor>,
    attention_mask: &Tensor,
    token_type_ids: &Tensor,
    doc_type_ids: Option<&Tensor>,
    position_ids: Option<&Tensor>,
    block_size: usize,
    pad_token_id: u32,
    word_embeddings: &Embedding,
) -> Result<PaddedInput> {
    let (b_sz, seq_len) = match (input_ids, inputs_embeds) {
        (Some(ids), None) => ids.dims2()?,
        (None, Some(embeds)) => {
            let (b_sz, seq_len, _) = embeds.dims3()?;
            (b_sz, seq_len)
        }
        (Some(_), Some(_)) => {
            candle::bail!("cannot specify both input_ids and inputs_embeds at the same time")
        }
        (None, None) => candle::bail!("either input_ids or inputs_embeds must be specified"),
    };

    let padding_len = (block_size - seq_len % block_size) % block_size;
    if padding_len == 0 {
        return Ok(PaddedInput {
            padding_len,
            input_ids: input_ids.cloned(),
            inputs_embeds: inputs_embeds.cloned(),
            attention_mask: attention_mask.clone(),
            token_type_ids: token_type_ids.clone(),
            doc_type_ids: doc_type_ids.cloned(),
            position_ids: position_ids.cloned(),
        });
    }
    tracing::debug!(
        seq_len,
        padded = seq_len + padding_len,
        block_size,
        "padding input to a multiple of the block size"
    );

    let input_ids = match input_ids {
        Some(ids) => Some(pad_ids(ids, padding_len, pad_token_id)?),
        None => None,
    };
    let inputs_embeds = match inputs_embeds {
        Some(embeds) => {
            let pad = Tensor::full(pad_token_id, (b_sz, padding_len), embeds.device())?;
            let pad_embeds = word_embeddings.forward(&pad)?.to_dtype(embeds.dtype())?;
            Some(Tensor::cat(&[embeds, &pad_embeds], 1)?)
        }
        None => None,
    };
    let position_ids = match position_ids {
        Some(ids) => Some(pad_ids(ids, padding_len, pad_token_id)?),
        None => None,
    };
    let doc_type_ids = match doc_type_ids {
        Some(ids) => Some(pad_ids(ids, padding_len, 0)?),
        None => None,
    };

    Ok(PaddedInput {
        padding_len,
        input_ids,
        inputs_embeds,
        attention_mask: pad_ids(attention_mask, padding_len, 0)?,
        token_type_ids: pad_ids(token_type_ids, padding_len, 0)?,
        doc_type_ids,
        position_ids,
    })
}

/// The mask family consumed by block-sparse attention.
#[derive(Debug, Clone)]
pub struct SparseAttentionMasks {
    /// (batch, num_blocks, block_size)
    pub blocked_mask: Tensor,
    /// (batch, 1, num_blocks - 4, block_size, 3 * block_size)
    pub band_mask: Tensor,
    /// (batch, 1, seq_len, 1) — query-position validity.
    pub from_mask: Tensor,
    /// (batch, 1, 1, seq_len) — key-position validity.
    pub to_mask: Tensor,
    pub block_size: usize,
}

/// Derive the blocked/band/from/to masks from a padded attention mask.
///
/// The band mask covers the "interior" blocks (all but the first two and
/// last two, which get global treatment): for interior block `i` it is the
/// outer product of that block's validity against the concatenated validity
/// of blocks `i-1`, `i`, `i+1`.
pub fn create_masks_for_block_sparse_attn(
    attention_mask: &Tensor,
    block_size: usize,
) -> Result<SparseAttentionMasks> {
    let (b_sz, seq_len) = attention_mask.dims2()?;
    if block_size == 0 || seq_len % block_size != 0 {
        candle::bail!(
            "sequence length must be a multiple of the block size, got seq_len {seq_len} with block size {block_size}"
        )
    }
    let num_blocks = seq_len / block_size;
    if num_blocks < 5 {
        candle::bail!(
            "block-sparse attention needs at least 5 blocks, got {num_blocks} (seq_len {seq_len}, block size {block_size})"
        )
    }

    let mask = attention_mask.to_dtype(DType::F32)?;
    let blocked_mask = mask.reshape((b_sz, num_blocks, block_size))?;

    // Validity of the three neighbouring "to" blocks of each interior block.
    let exp_blocked_to_pad = Tensor::cat(
        &[
            blocked_mask.narrow(1, 1, num_blocks - 4)?,
            blocked_mask.narrow(1, 2, num_blocks - 4)?,
            blocked_mask.narrow(1, 3, num_blocks - 4)?,
        ],
        2,
    )?;
    let from_blocked = blocked_mask.narrow(1, 2, num_blocks - 4)?;
    // Outer product per block: (b, l, q, 1) * (b, l, 1, 3k)
    let band_mask = from_blocked
        .unsqueeze(3)?
        .broadcast_mul(&exp_blocked_to_pad.unsqueeze(2)?)?
        .unsqueeze(1)?;

    let from_mask = mask.reshape((b_sz, 1, seq_len, 1))?;
    let to_mask = mask.reshape((b_sz, 1, 1, seq_len))?;

    Ok(SparseAttentionMasks {
        blocked_mask,
        band_mask,
        from_mask,
        to_mask,
        block_size,
    })
}

/// Materialise the block-sparse pattern as an additive bias over dense
/// attention scores, shape (batch, 1, seq_len, seq_len).
///
/// A query block attends to the two first and two last blocks (global), to
/// its immediate neighbours (the band) and to itself; everything else is
/// masked out, as are padding key positions. Queries in the first/last two
/// blocks attend everywhere. This reproduces the block-sparse reachability
/// exactly; only the gather-based compute layout of a fused kernel is
/// skipped.
pub fn sparse_attention_bias(masks: &SparseAttentionMasks, device: &Device) -> Result<Tensor> {
    let (_, num_blocks, block_size) = masks.blocked_mask.dims3()?;
    let seq_len = num_blocks * block_size;

    let is_global = |blk: usize| blk < 2 || blk >= num_blocks - 2;
    let pattern: Vec<f32> = (0..seq_len)
        .flat_map(|q| {
            let qb = q / block_size;
            (0..seq_len).map(move |k| {
                let kb = k / block_size;
                let local = qb.abs_diff(kb) <= 1;
                if is_global(qb) || is_global(kb) || local {
                    1f32
                } else {
                    0f32
                }
            })
        })
        .collect();
    let pattern = Tensor::from_vec(pattern, (1, 1, seq_len, seq_len), device)?;

    // Reachable and non-padding keys attend with bias 0, everything else with
    // the minimum representable value.
    let valid = pattern.broadcast_mul(&masks.to_mask)?;
    let on_false = valid.ones_like()?.affine(f32::MIN as f64, 0.)?;
    valid.gt(0.5)?.where_cond(&valid.zeros_like()?, &on_false)
}

/// Build a causal mask of shape (1, 1, tgt_len, tgt_len + past_len): the
/// upper triangle is -inf so a position attends to itself and everything
/// before it, including cached positions.
pub fn make_causal_mask(tgt_len: usize, past_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..tgt_len)
        .flat_map(|i| (0..tgt_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0f32 }))
        .collect();
    let mask = Tensor::from_vec(mask, (tgt_len, tgt_len), device)?;
    let mask = if past_len > 0 {
        let past = Tensor::zeros((tgt_len, past_len), DType::F32, device)?;
        Tensor::cat(&[&past, &mask], 1)?
    } else {
        mask
    };
    mask.reshape((1, 1, tgt_len, tgt_len + past_len))
}

/// Expand a (batch, src_len) padding mask to the additive form
/// (batch, 1, tgt_len, src_len): 0 where attendable, minimum representable
/// value where padded.
pub fn expand_mask(mask: &Tensor, tgt_len: usize) -> Result<Tensor> {
    let (b_sz, src_len) = mask.dims2()?;
    let inverted = mask
        .to_dtype(DType::F32)?
        .affine(-1., 1.)?
        .reshape((b_sz, 1, 1, src_len))?;
    (inverted * f32::MIN as f64)?.broadcast_as((b_sz, 1, tgt_len, src_len))
}

/// Combined causal + padding mask for decoder self-attention. Both parts are
/// additive penalties, so they combine by addition. Returns None when
/// neither applies (single-step decode without a padding mask).
pub fn prepare_decoder_attention_mask(
    attention_mask: Option<&Tensor>,
    tgt_len: usize,
    past_len: usize,
    device: &Device,
) -> Result<Option<Tensor>> {
    let causal = if tgt_len > 1 {
        Some(make_causal_mask(tgt_len, past_len, device)?)
    } else {
        None
    };
    let expanded = match attention_mask {
        Some(mask) => Some(expand_mask(mask, tgt_len)?),
        None => None,
    };
    match (causal, expanded) {
        (Some(causal), Some(expanded)) => Ok(Some(expanded.broadcast_add(&causal)?)),
        (Some(causal), None) => Ok(Some(causal)),
        (None, expanded) => Ok(expanded),
    }
}
