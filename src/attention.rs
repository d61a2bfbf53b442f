use candle::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Multi-head attention with optional KV-cache.
///
/// Used in three places with different caching behaviour:
/// - Encoder self-attention: no cache (processes the full sequence once)
/// - Decoder self-attention: cache grows along the sequence axis
/// - Decoder cross-attention: encoder K/V computed once and reused
#[derive(Debug, Clone)]
pub struct Attention {
    head_dim: usize,
    num_heads: usize,
    scaling: f64,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    kv_cache: Option<(Tensor, Tensor)>,
    enable_kv_cache: bool,
    span: tracing::Span,
}

impl Attention {
    pub fn load(
        vb: VarBuilder,
        embed_dim: usize,
        num_heads: usize,
        kv_input_dim: usize,
        enable_kv_cache: bool,
    ) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        let q_proj = linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = linear(kv_input_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = linear(kv_input_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            head_dim,
            num_heads,
            scaling: 1.0 / (head_dim as f64).sqrt(),
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            kv_cache: None,
            enable_kv_cache,
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        })
    }

    /// Load attention for the encoder (no KV cache).
    pub fn load_for_encoder(vb: VarBuilder, embed_dim: usize, num_heads: usize) -> Result<Self> {
        Self::load(vb, embed_dim, num_heads, embed_dim, false)
    }

    pub fn reset_kv_cache(&mut self) {
        self.kv_cache = None;
    }

    /// Length of the cached key sequence, 0 without a cache.
    pub fn past_kv_len(&self) -> usize {
        match &self.kv_cache {
            Some((k, _)) => k.dims()[2],
            None => 0,
        }
    }

    /// Reindex the cached K/V along the batch axis (beam search reordering).
    pub fn reorder_kv_cache(&mut self, beam_idx: &Tensor) -> Result<()> {
        if let Some((k, v)) = &self.kv_cache {
            let k = k.index_select(beam_idx, 0)?;
            let v = v.index_select(beam_idx, 0)?;
            self.kv_cache = Some((k, v));
        }
        Ok(())
    }

    fn shape(&self, tensor: &Tensor, b_sz: usize) -> Result<Tensor> {
        tensor
            .reshape((b_sz, (), self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attention forward pass.
    ///
    /// `kv_states` switches between self-attention (None) and cross-attention
    /// (encoder hidden states). `attn_mask` is an additive bias broadcast to
    /// (batch, heads, tgt_len, src_len). `layer_head_mask` scales attention
    /// probabilities per head, shape (num_heads,).
    pub fn forward(
        &mut self,
        xs: &Tensor,
        kv_states: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, tgt_len, _) = xs.dims3()?;
        let query_states = (xs.apply(&self.q_proj)? * self.scaling)?;

        let (key_states, value_states) = match kv_states {
            None => {
                // Self-attention: compute K/V from input
                let key_states = self.shape(&xs.apply(&self.k_proj)?, b_sz)?;
                let value_states = self.shape(&xs.apply(&self.v_proj)?, b_sz)?;

                if self.enable_kv_cache {
                    let kv_states = match &self.kv_cache {
                        None => (key_states, value_states),
                        Some((p_key_states, p_value_states)) => {
                            let key_states = Tensor::cat(&[p_key_states, &key_states], 2)?;
                            let value_states = Tensor::cat(&[p_value_states, &value_states], 2)?;
                            (key_states, value_states)
                        }
                    };
                    self.kv_cache = Some(kv_states.clone());
                    kv_states
                } else {
                    (key_states, value_states)
                }
            }
            Some(kv_states) => {
                // Cross-attention: K/V come from the encoder output, which is
                // fixed for the whole decode, so the cache never grows.
                if self.enable_kv_cache {
                    if let Some((cached_k, cached_v)) = &self.kv_cache {
                        (cached_k.clone(), cached_v.clone())
                    } else {
                        let key_states = self.shape(&kv_states.apply(&self.k_proj)?, b_sz)?;
                        let value_states = self.shape(&kv_states.apply(&self.v_proj)?, b_sz)?;
                        self.kv_cache = Some((key_states.clone(), value_states.clone()));
                        (key_states, value_states)
                    }
                } else {
                    let key_states = self.shape(&kv_states.apply(&self.k_proj)?, b_sz)?;
                    let value_states = self.shape(&kv_states.apply(&self.v_proj)?, b_sz)?;
                    (key_states, value_states)
                }
            }
        };

        let src_len = key_states.dims()[2];
        let query_states = self.shape(&query_states, b_sz)?;

        let attn_weights = query_states.matmul(&key_states.transpose(2, 3)?.contiguous()?)?;
        let attn_weights = match attn_mask {
            None => attn_weights,
            Some(attn_mask) => attn_weights.broadcast_add(attn_mask)?,
        };
        let attn_probs = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_probs = match layer_head_mask {
            None => attn_probs,
            Some(layer_head_mask) => {
                let scale = layer_head_mask.reshape((1, self.num_heads, 1, 1))?;
                attn_probs.broadcast_mul(&scale)?
            }
        };
        let attn_output = attn_probs
            .matmul(&value_states)?
            .reshape((b_sz, self.num_heads, tgt_len, self.head_dim))?;
        debug_assert_eq!(attn_probs.dims()[3], src_len);

        attn_output
            .transpose(1, 2)?
            .reshape((b_sz, tgt_len, self.head_dim * self.num_heads))?
            .apply(&self.out_proj)
    }
}
