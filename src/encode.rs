//! BigBird encoder with block-sparse attention over long documents.

use candle::{Result, Tensor};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, Module, VarBuilder};

use crate::attention::Attention;
use crate::config::{AttentionType, BigBirdConfig};
use crate::embed::BigBirdEmbeddings;
use crate::mask;

/// Encoder layer: self-attention plus FFN, post-norm.
#[derive(Debug, Clone)]
pub struct BigBirdEncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    activation_fn: candle_nn::Activation,
    dropout: Dropout,
}

impl BigBirdEncoderLayer {
    fn load(vb: VarBuilder, cfg: &BigBirdConfig) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let self_attn =
            Attention::load_for_encoder(vb.pp("self_attn"), hidden, cfg.num_attention_heads)?;
        let self_attn_layer_norm =
            layer_norm(hidden, cfg.layer_norm_eps, vb.pp("self_attn_layer_norm"))?;
        let fc1 = linear(hidden, cfg.intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(cfg.intermediate_size, hidden, vb.pp("fc2"))?;
        let final_layer_norm = layer_norm(hidden, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?;

        Ok(Self {
            self_attn,
            self_attn_layer_norm,
            fc1,
            fc2,
            final_layer_norm,
            activation_fn: cfg.hidden_act,
            dropout: Dropout::new(cfg.hidden_dropout_prob),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attn_bias: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = xs.clone();
        let xs = self.self_attn.forward(xs, None, attn_bias, layer_head_mask)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = (xs + residual)?;
        let xs = self.self_attn_layer_norm.forward(&xs)?;

        let residual = xs.clone();
        let xs = self.fc1.forward(&xs)?;
        let xs = self.activation_fn.forward(&xs)?;
        let xs = self.fc2.forward(&xs)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = (xs + residual)?;
        self.final_layer_norm.forward(&xs)
    }
}

/// Encoder output, already trimmed back to the caller's sequence length.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub last_hidden_state: Tensor,
    pub pooler_output: Option<Tensor>,
}

/// Optional per-call encoder inputs; `input_ids`/`inputs_embeds` are passed
/// separately since exactly one of them is required.
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions<'a> {
    pub attention_mask: Option<&'a Tensor>,
    pub token_type_ids: Option<&'a Tensor>,
    pub doc_type_ids: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
    pub train: bool,
}

/// BigBird encoder: summed embeddings, block-sparse (or dense) self-attention
/// layers and an optional pooler.
#[derive(Debug, Clone)]
pub struct BigBirdEncoder {
    embeddings: BigBirdEmbeddings,
    layers: Vec<BigBirdEncoderLayer>,
    pooler: Option<Linear>,
    attention_type: AttentionType,
    block_size: usize,
    max_tokens_to_attend: usize,
    pad_token_id: u32,
    hidden_size: usize,
    span: tracing::Span,
}

impl BigBirdEncoder {
    pub fn load(vb: VarBuilder, cfg: &BigBirdConfig, add_pooling_layer: bool) -> Result<Self> {
        let embeddings = BigBirdEmbeddings::load(vb.pp("embeddings"), cfg)?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_l = vb.pp("layers");
        for idx in 0..cfg.num_hidden_layers {
            layers.push(BigBirdEncoderLayer::load(vb_l.pp(idx), cfg)?);
        }
        let pooler = if add_pooling_layer {
            Some(linear(cfg.hidden_size, cfg.hidden_size, vb.pp("pooler"))?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            layers,
            pooler,
            attention_type: cfg.attention_type,
            block_size: cfg.block_size,
            max_tokens_to_attend: cfg.max_tokens_to_attend(),
            pad_token_id: cfg.pad_token_id,
            hidden_size: cfg.hidden_size,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    pub fn word_embeddings(&self) -> &candle_nn::Embedding {
        self.embeddings.word_embeddings()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Attention flavour actually used for a given sequence length:
    /// block-sparse only pays off (and only works) once the sequence exceeds
    /// the global + sliding + random token budget.
    pub fn effective_attention_type(&self, seq_len: usize) -> AttentionType {
        match self.attention_type {
            AttentionType::OriginalFull => AttentionType::OriginalFull,
            AttentionType::BlockSparse if seq_len <= self.max_tokens_to_attend => {
                tracing::warn!(
                    seq_len,
                    max_tokens_to_attend = self.max_tokens_to_attend,
                    block_size = self.block_size,
                    "sequence too short for block-sparse attention, falling back to original_full"
                );
                AttentionType::OriginalFull
            }
            AttentionType::BlockSparse => AttentionType::BlockSparse,
        }
    }

    pub fn forward(
        &mut self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        opts: &EncodeOptions,
    ) -> Result<EncoderOutput> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, device) = match (input_ids, inputs_embeds) {
            (Some(ids), None) => {
                let (b, s) = ids.dims2()?;
                (b, s, ids.device().clone())
            }
            (None, Some(embeds)) => {
                let (b, s, _) = embeds.dims3()?;
                (b, s, embeds.device().clone())
            }
            (Some(_), Some(_)) => {
                candle::bail!("cannot specify both input_ids and inputs_embeds at the same time")
            }
            (None, None) => candle::bail!("either input_ids or inputs_embeds must be specified"),
        };

        let attention_mask = match opts.attention_mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((b_sz, seq_len), candle::DType::U32, &device)?,
        };
        let token_type_ids = match opts.token_type_ids {
            Some(ids) => ids.clone(),
            None => Tensor::zeros((b_sz, seq_len), candle::DType::U32, &device)?,
        };
        if let Some(head_mask) = opts.head_mask {
            if head_mask.dims()[0] != self.layers.len() {
                candle::bail!(
                    "head_mask must cover {} layers, got {}",
                    self.layers.len(),
                    head_mask.dims()[0]
                )
            }
        }

        let (padded, attn_bias) = match self.effective_attention_type(seq_len) {
            AttentionType::BlockSparse => {
                let padded = mask::pad_to_block_size(
                    input_ids,
                    inputs_embeds,
                    &attention_mask,
                    &token_type_ids,
                    opts.doc_type_ids,
                    opts.position_ids,
                    self.block_size,
                    self.pad_token_id,
                    self.embeddings.word_embeddings(),
                )?;
                let masks =
                    mask::create_masks_for_block_sparse_attn(&padded.attention_mask, self.block_size)?;
                let bias = mask::sparse_attention_bias(&masks, &device)?;
                (padded, bias)
            }
            AttentionType::OriginalFull => {
                let padded = mask::PaddedInput {
                    padding_len: 0,
                    input_ids: input_ids.cloned(),
                    inputs_embeds: inputs_embeds.cloned(),
                    attention_mask: attention_mask.clone(),
                    token_type_ids: token_type_ids.clone(),
                    doc_type_ids: opts.doc_type_ids.cloned(),
                    position_ids: opts.position_ids.cloned(),
                };
                let bias = mask::expand_mask(&attention_mask, seq_len)?;
                (padded, bias)
            }
        };

        let mut xs = self.embeddings.forward(
            padded.input_ids.as_ref(),
            padded.inputs_embeds.as_ref(),
            &padded.token_type_ids,
            padded.position_ids.as_ref(),
            padded.doc_type_ids.as_ref(),
            0,
            opts.train,
        )?;

        for (idx, layer) in self.layers.iter_mut().enumerate() {
            let layer_head_mask = match opts.head_mask {
                Some(head_mask) => Some(head_mask.get(idx)?),
                None => None,
            };
            xs = layer.forward(&xs, Some(&attn_bias), layer_head_mask.as_ref(), opts.train)?;
        }

        let pooler_output = match &self.pooler {
            Some(pooler) => Some(xs.narrow(1, 0, 1)?.squeeze(1)?.apply(pooler)?.tanh()?),
            None => None,
        };

        // Trim the block padding so downstream code sees the caller's length.
        let last_hidden_state = if padded.padding_len > 0 {
            xs.narrow(1, 0, seq_len)?
        } else {
            xs
        };

        Ok(EncoderOutput {
            last_hidden_state,
            pooler_output,
        })
    }
}
