//! BART decoder with cross-attention, doc-type embeddings and LayerDrop.

use candle::{Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Dropout, Embedding, LayerNorm, Linear, Module, VarBuilder};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::BartConfig;
use crate::embed::BartLearnedPositionalEmbedding;
use crate::mask;
use crate::attention::Attention;

/// Decoder layer with self-attention, cross-attention and FFN, post-norm.
#[derive(Debug, Clone)]
pub struct BartDecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    activation_fn: candle_nn::Activation,
    dropout: Dropout,
}

impl BartDecoderLayer {
    fn load(vb: VarBuilder, cfg: &BartConfig, cross_attn_input_dim: usize) -> Result<Self> {
        let embed_dim = cfg.d_model;
        let heads = cfg.decoder_attention_heads;
        // Decoder self-attention caches K/V for incremental decoding
        let self_attn = Attention::load(vb.pp("self_attn"), embed_dim, heads, embed_dim, true)?;
        let self_attn_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("self_attn_layer_norm"))?;
        // Cross-attention caches the (fixed) encoder K/V
        let encoder_attn = Attention::load(
            vb.pp("encoder_attn"),
            embed_dim,
            heads,
            cross_attn_input_dim,
            true,
        )?;
        let encoder_attn_layer_norm =
            layer_norm(embed_dim, 1e-5, vb.pp("encoder_attn_layer_norm"))?;
        let fc1 = linear(embed_dim, cfg.decoder_ffn_dim, vb.pp("fc1"))?;
        let fc2 = linear(cfg.decoder_ffn_dim, embed_dim, vb.pp("fc2"))?;
        let final_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("final_layer_norm"))?;

        Ok(Self {
            self_attn,
            self_attn_layer_norm,
            encoder_attn,
            encoder_attn_layer_norm,
            fc1,
            fc2,
            final_layer_norm,
            activation_fn: cfg.activation_function,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn reset_kv_cache(&mut self) {
        self.self_attn.reset_kv_cache();
        self.encoder_attn.reset_kv_cache();
    }

    fn reset_cross_attn_cache(&mut self) {
        self.encoder_attn.reset_kv_cache();
    }

    fn past_kv_len(&self) -> usize {
        self.self_attn.past_kv_len()
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        cross_attn_layer_head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = xs.clone();
        let xs = self
            .self_attn
            .forward(xs, None, attention_mask, layer_head_mask)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = (xs + residual)?;
        let mut xs = self.self_attn_layer_norm.forward(&xs)?;

        if let Some(encoder_hidden_states) = encoder_hidden_states {
            let residual = xs.clone();
            xs = self.encoder_attn.forward(
                &xs,
                Some(encoder_hidden_states),
                encoder_attention_mask,
                cross_attn_layer_head_mask,
            )?;
            xs = self.dropout.forward(&xs, train)?;
            xs = (xs + residual)?;
            xs = self.encoder_attn_layer_norm.forward(&xs)?;
        }

        let residual = xs.clone();
        let xs = self.fc1.forward(&xs)?;
        let xs = self.activation_fn.forward(&xs)?;
        let xs = self.fc2.forward(&xs)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = (xs + residual)?;
        self.final_layer_norm.forward(&xs)
    }
}

/// Optional per-call decoder inputs.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions<'a> {
    pub attention_mask: Option<&'a Tensor>,
    pub doc_type_ids: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
    /// Keep the self-attention KV-cache across calls (incremental decoding).
    /// When false, all caches are cleared at entry.
    pub use_cache: bool,
    pub train: bool,
}

/// BART decoder with embeddings shared with the encoder and an optional
/// doc-type term.
#[derive(Debug, Clone)]
pub struct BartDecoder {
    embed_tokens: Embedding,
    doc_type_tokens: Option<Embedding>,
    embed_positions: BartLearnedPositionalEmbedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<BartDecoderLayer>,
    dropout: Dropout,
    layerdrop: f64,
    embed_scale: Option<f64>,
    rng: StdRng,
    span: tracing::Span,
}

impl BartDecoder {
    /// Load the decoder; `embed_tokens` allows sharing the word-embedding
    /// table with the encoder, `cross_attn_input_dim` is the hidden size of
    /// the encoder output fed to cross-attention.
    pub fn load(
        vb: VarBuilder,
        cfg: &BartConfig,
        embed_tokens: Option<Embedding>,
        cross_attn_input_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        let embed_tokens = match embed_tokens {
            Some(e) => e,
            None => embedding(cfg.vocab_size, cfg.d_model, vb.pp("embed_tokens"))?,
        };
        let doc_type_tokens = match cfg.doc_type_size {
            Some(doc_type_size) => {
                Some(embedding(doc_type_size, cfg.d_model, vb.pp("doc_type_tokens"))?)
            }
            None => None,
        };
        let embed_positions = BartLearnedPositionalEmbedding::load(vb.pp("embed_positions"), cfg)?;
        let layernorm_embedding = layer_norm(cfg.d_model, 1e-5, vb.pp("layernorm_embedding"))?;

        let mut layers = Vec::with_capacity(cfg.decoder_layers);
        let vb_l = vb.pp("layers");
        for idx in 0..cfg.decoder_layers {
            layers.push(BartDecoderLayer::load(vb_l.pp(idx), cfg, cross_attn_input_dim)?);
        }

        let embed_scale = cfg.scale_embedding.then(|| (cfg.d_model as f64).sqrt());

        Ok(Self {
            embed_tokens,
            doc_type_tokens,
            embed_positions,
            layernorm_embedding,
            layers,
            dropout: Dropout::new(cfg.dropout),
            layerdrop: cfg.decoder_layerdrop,
            embed_scale,
            rng: StdRng::seed_from_u64(seed),
            span: tracing::span!(tracing::Level::TRACE, "decoder"),
        })
    }

    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    pub fn reset_kv_cache(&mut self) {
        self.layers.iter_mut().for_each(|l| l.reset_kv_cache());
    }

    /// Reset only the cross-attention cache (when the encoder output changes).
    pub fn reset_cross_attn_cache(&mut self) {
        self.layers
            .iter_mut()
            .for_each(|l| l.reset_cross_attn_cache());
    }

    /// Length of the cached self-attention prefix.
    pub fn past_kv_len(&self) -> usize {
        self.layers.first().map_or(0, |l| l.past_kv_len())
    }

    /// Reindex the self-attention caches for beam search. Cross-attention
    /// caches derive only from the fixed encoder output and stay untouched.
    pub fn reorder_cache(&mut self, beam_idx: &Tensor) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.self_attn.reorder_kv_cache(beam_idx)?;
        }
        Ok(())
    }

    pub fn forward(
        &mut self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        opts: &DecodeOptions,
    ) -> Result<Tensor> {
        let span = self.span.clone();
        let _enter = span.enter();
        if !opts.use_cache {
            self.reset_kv_cache();
        }
        let past_kv_len = self.past_kv_len();

        let inputs_embeds = match (input_ids, inputs_embeds) {
            (Some(ids), None) => {
                let embeds = self.embed_tokens.forward(ids)?;
                match self.embed_scale {
                    Some(scale) => (embeds * scale)?,
                    None => embeds,
                }
            }
            // Caller-provided embeddings are used as-is, without the
            // embedding scale (they may already carry their own scaling).
            (None, Some(embeds)) => embeds.clone(),
            (Some(_), Some(_)) => candle::bail!(
                "cannot specify both decoder_input_ids and decoder_inputs_embeds at the same time"
            ),
            (None, None) => {
                candle::bail!("either decoder_input_ids or decoder_inputs_embeds must be specified")
            }
        };
        let (_, seq_len, _) = inputs_embeds.dims3()?;
        let device = inputs_embeds.device();

        for (head_mask, name) in [
            (opts.head_mask, "head_mask"),
            (opts.cross_attn_head_mask, "cross_attn_head_mask"),
        ] {
            if let Some(head_mask) = head_mask {
                if head_mask.dims()[0] != self.layers.len() {
                    candle::bail!(
                        "{name} must cover {} layers, got {}",
                        self.layers.len(),
                        head_mask.dims()[0]
                    )
                }
            }
        }

        let attention_mask =
            mask::prepare_decoder_attention_mask(opts.attention_mask, seq_len, past_kv_len, device)?;
        let encoder_attention_mask = match (encoder_hidden_states, encoder_attention_mask) {
            (Some(_), Some(enc_mask)) => Some(mask::expand_mask(enc_mask, seq_len)?),
            _ => None,
        };

        let positions = self.embed_positions.forward(seq_len, past_kv_len, device)?;
        let mut hidden_states = inputs_embeds.broadcast_add(&positions)?;
        if let Some(doc_type_ids) = opts.doc_type_ids {
            let doc_type_embeddings = match &self.doc_type_tokens {
                Some(table) => table.forward(doc_type_ids)?,
                None => candle::bail!(
                    "doc_type_ids were provided but the decoder has no doc-type embedding table (doc_type_size is unset)"
                ),
            };
            hidden_states = hidden_states.broadcast_add(&doc_type_embeddings)?;
        }
        hidden_states = self.layernorm_embedding.forward(&hidden_states)?;
        hidden_states = self.dropout.forward(&hidden_states, opts.train)?;

        for (idx, layer) in self.layers.iter_mut().enumerate() {
            // LayerDrop: during training a whole layer is skipped at random.
            if opts.train && self.layerdrop > 0. && self.rng.gen::<f64>() < self.layerdrop {
                continue;
            }
            let layer_head_mask = match opts.head_mask {
                Some(head_mask) => Some(head_mask.get(idx)?),
                None => None,
            };
            let cross_attn_layer_head_mask = match opts.cross_attn_head_mask {
                Some(head_mask) => Some(head_mask.get(idx)?),
                None => None,
            };
            hidden_states = layer.forward(
                &hidden_states,
                attention_mask.as_ref(),
                encoder_hidden_states,
                encoder_attention_mask.as_ref(),
                layer_head_mask.as_ref(),
                cross_attn_layer_head_mask.as_ref(),
                opts.train,
            )?;
        }

        Ok(hidden_states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    fn cfg() -> BartConfig {
        BartConfig {
            vocab_size: 32,
            d_model: 8,
            decoder_layers: 2,
            decoder_attention_heads: 2,
            decoder_ffn_dim: 16,
            activation_function: candle_nn::Activation::Gelu,
            max_position_embeddings: 64,
            dropout: 0.0,
            decoder_layerdrop: 0.0,
            pad_token_id: 0,
            decoder_start_token_id: 1,
            scale_embedding: true,
            doc_type_size: Some(4),
        }
    }

    fn decoder(cfg: &BartConfig, dev: &Device) -> Result<BartDecoder> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        BartDecoder::load(vb, cfg, None, 8, 42)
    }

    #[test]
    fn forward_requires_exactly_one_input_kind() -> Result<()> {
        let dev = Device::Cpu;
        let mut dec = decoder(&cfg(), &dev)?;
        let ids = Tensor::ones((1, 3), DType::U32, &dev)?;
        let embeds = Tensor::zeros((1, 3, 8), DType::F32, &dev)?;
        let opts = DecodeOptions::default();
        assert!(dec
            .forward(Some(&ids), Some(&embeds), None, None, &opts)
            .is_err());
        assert!(dec.forward(None, None, None, None, &opts).is_err());
        Ok(())
    }

    #[test]
    fn cache_grows_only_when_requested() -> Result<()> {
        let dev = Device::Cpu;
        let mut dec = decoder(&cfg(), &dev)?;
        let enc = Tensor::randn(0f32, 1f32, (1, 4, 8), &dev)?;
        let step = Tensor::ones((1, 1), DType::U32, &dev)?;
        let cached = DecodeOptions {
            use_cache: true,
            ..Default::default()
        };
        dec.forward(Some(&step), None, Some(&enc), None, &cached)?;
        dec.forward(Some(&step), None, Some(&enc), None, &cached)?;
        assert_eq!(dec.past_kv_len(), 2);
        // A non-cached call starts from scratch.
        let ids = Tensor::ones((1, 3), DType::U32, &dev)?;
        dec.forward(Some(&ids), None, Some(&enc), None, &DecodeOptions::default())?;
        assert_eq!(dec.past_kv_len(), 3);
        Ok(())
    }

    #[test]
    fn doc_type_ids_without_table_is_an_error() -> Result<()> {
        let dev = Device::Cpu;
        let mut cfg = cfg();
        cfg.doc_type_size = None;
        let mut dec = decoder(&cfg, &dev)?;
        let ids = Tensor::ones((1, 3), DType::U32, &dev)?;
        let doc_type_ids = Tensor::zeros((1, 3), DType::U32, &dev)?;
        let opts = DecodeOptions {
            doc_type_ids: Some(&doc_type_ids),
            ..Default::default()
        };
        assert!(dec.forward(Some(&ids), None, None, None, &opts).is_err());
        Ok(())
    }

    #[test]
    fn cross_attn_head_mask_layer_count_is_validated() -> Result<()> {
        let dev = Device::Cpu;
        let mut dec = decoder(&cfg(), &dev)?;
        let ids = Tensor::ones((1, 3), DType::U32, &dev)?;
        let enc = Tensor::randn(0f32, 1f32, (1, 4, 8), &dev)?;
        let bad = Tensor::ones((1, 2), DType::F32, &dev)?;
        let opts = DecodeOptions {
            cross_attn_head_mask: Some(&bad),
            ..Default::default()
        };
        assert!(dec
            .forward(Some(&ids), None, Some(&enc), None, &opts)
            .is_err());
        Ok(())
    }
}
