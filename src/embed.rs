//! Input embedding layers for both sides of the model.
//!
//! The encoder sums word, position, token-type and (optionally) document-type
//! embeddings, BigBird style. The decoder uses BART's learned positional
//! embedding with its offset convention; its doc-type term is added in the
//! decoder itself.

use candle::{Result, Tensor};
use candle_nn::{embedding, layer_norm, Dropout, Embedding, LayerNorm, Module, VarBuilder};

use crate::config::{BartConfig, BigBirdConfig};

/// BigBird-style summed embeddings with an optional doc-type term.
#[derive(Debug, Clone)]
pub struct BigBirdEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    doc_type_embeddings: Option<Embedding>,
    layer_norm: LayerNorm,
    dropout: Dropout,
    /// sqrt(hidden_size) applied to word embeddings before any additive term.
    rescale: Option<f64>,
}

impl BigBirdEmbeddings {
    pub fn load(vb: VarBuilder, cfg: &BigBirdConfig) -> Result<Self> {
        let word_embeddings =
            embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?;
        let position_embeddings = embedding(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = embedding(
            cfg.type_vocab_size,
            cfg.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let doc_type_embeddings = match cfg.doc_type_size {
            Some(doc_type_size) => Some(embedding(
                doc_type_size,
                cfg.hidden_size,
                vb.pp("doc_type_embeddings"),
            )?),
            None => None,
        };
        let layer_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        let rescale = cfg
            .rescale_embeddings
            .then(|| (cfg.hidden_size as f64).sqrt());
        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            doc_type_embeddings,
            layer_norm,
            dropout: Dropout::new(cfg.hidden_dropout_prob),
            rescale,
        })
    }

    pub fn word_embeddings(&self) -> &Embedding {
        &self.word_embeddings
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        token_type_ids: &Tensor,
        position_ids: Option<&Tensor>,
        doc_type_ids: Option<&Tensor>,
        past_kv_len: usize,
        train: bool,
    ) -> Result<Tensor> {
        let inputs_embeds = match (input_ids, inputs_embeds) {
            (Some(ids), None) => self.word_embeddings.forward(ids)?,
            (None, Some(embeds)) => embeds.clone(),
            (Some(_), Some(_)) => {
                candle::bail!("cannot specify both input_ids and inputs_embeds at the same time")
            }
            (None, None) => candle::bail!("either input_ids or inputs_embeds must be specified"),
        };
        let (_, seq_len, _) = inputs_embeds.dims3()?;

        // The rescale happens strictly before any additive composition.
        let inputs_embeds = match self.rescale {
            Some(scale) => (inputs_embeds * scale)?,
            None => inputs_embeds,
        };

        let position_embeddings = match position_ids {
            Some(ids) => self.position_embeddings.forward(ids)?,
            None => {
                let positions = Tensor::arange(
                    past_kv_len as u32,
                    (past_kv_len + seq_len) as u32,
                    inputs_embeds.device(),
                )?
                .unsqueeze(0)?;
                self.position_embeddings.forward(&positions)?
            }
        };

        let mut embeddings = inputs_embeds
            .broadcast_add(&self.token_type_embeddings.forward(token_type_ids)?)?
            .broadcast_add(&position_embeddings)?;
        if let Some(doc_type_ids) = doc_type_ids {
            let doc_type_embeddings = match &self.doc_type_embeddings {
                Some(table) => table.forward(doc_type_ids)?,
                None => candle::bail!(
                    "doc_type_ids were provided but the encoder has no doc-type embedding table (doc_type_size is unset)"
                ),
            };
            embeddings = embeddings.broadcast_add(&doc_type_embeddings)?;
        }

        let embeddings = self.dropout.forward(&embeddings, train)?;
        self.layer_norm.forward(&embeddings)
    }
}

/// Learned positional embedding with offset (BART convention).
#[derive(Debug, Clone)]
pub struct BartLearnedPositionalEmbedding {
    offset: usize,
    weights: Embedding,
}

impl BartLearnedPositionalEmbedding {
    pub fn load(vb: VarBuilder, cfg: &BartConfig) -> Result<Self> {
        // BART reserves positions 0 and 1
        let offset: usize = 2;
        let num_embeddings = cfg.max_position_embeddings + offset;
        let weights = embedding(num_embeddings, cfg.d_model, vb)?;
        Ok(Self { offset, weights })
    }

    pub fn forward(&self, seq_len: usize, past_kv_len: usize, device: &candle::Device) -> Result<Tensor> {
        let positions = Tensor::arange(
            (past_kv_len + self.offset) as u32,
            (past_kv_len + seq_len + self.offset) as u32,
            device,
        )?
        .unsqueeze(0)?;
        self.weights.forward(&positions)
    }
}
