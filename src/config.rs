use candle::Result;

fn default_block_size() -> usize {
    64
}

fn default_num_random_blocks() -> usize {
    3
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_scale_embedding() -> bool {
    true
}

fn default_seed() -> u64 {
    299792458
}

/// Encoder self-attention flavour.
///
/// `BlockSparse` is only usable once the sequence is long enough to cover the
/// global + sliding + random token budget; shorter inputs are silently run
/// with `OriginalFull` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    OriginalFull,
    BlockSparse,
}

impl Default for AttentionType {
    fn default() -> Self {
        Self::BlockSparse
    }
}

/// Configuration for the BigBird encoder side.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct BigBirdConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: candle_nn::Activation,
    #[serde(default)]
    pub hidden_dropout_prob: f32,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default)]
    pub attention_type: AttentionType,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_num_random_blocks")]
    pub num_random_blocks: usize,
    /// Multiply word embeddings by sqrt(hidden_size) before the additive
    /// position/token-type/doc-type terms.
    #[serde(default)]
    pub rescale_embeddings: bool,
    /// Cardinality of the document-type feature. None disables the doc-type
    /// embedding table entirely.
    #[serde(default)]
    pub doc_type_size: Option<usize>,
}

impl BigBirdConfig {
    /// Longest sequence that still fits entirely in the global + sliding +
    /// random attention budget. Block-sparse attention is pointless (and
    /// unsupported) at or below this length.
    pub fn max_tokens_to_attend(&self) -> usize {
        (5 + 2 * self.num_random_blocks) * self.block_size
    }

    /// Preset matching monologg/kobigbird-bert-base.
    pub fn kobigbird_base() -> Self {
        Self {
            vocab_size: 32500,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: candle_nn::Activation::Gelu,
            hidden_dropout_prob: 0.1,
            max_position_embeddings: 4096,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
            attention_type: AttentionType::BlockSparse,
            block_size: 64,
            num_random_blocks: 3,
            rescale_embeddings: false,
            doc_type_size: None,
        }
    }
}

/// Configuration for the BART decoder side.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct BartConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub decoder_layers: usize,
    pub decoder_attention_heads: usize,
    pub decoder_ffn_dim: usize,
    pub activation_function: candle_nn::Activation,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub dropout: f32,
    /// Probability of skipping a whole decoder layer during training.
    #[serde(default)]
    pub decoder_layerdrop: f64,
    #[serde(default)]
    pub pad_token_id: u32,
    pub decoder_start_token_id: u32,
    #[serde(default = "default_scale_embedding")]
    pub scale_embedding: bool,
    #[serde(default)]
    pub doc_type_size: Option<usize>,
}

impl BartConfig {
    /// Preset matching gogamza/kobart-base-v2.
    pub fn kobart_base() -> Self {
        Self {
            vocab_size: 30000,
            d_model: 768,
            decoder_layers: 6,
            decoder_attention_heads: 16,
            decoder_ffn_dim: 3072,
            activation_function: candle_nn::Activation::Gelu,
            max_position_embeddings: 1026,
            dropout: 0.1,
            decoder_layerdrop: 0.0,
            pad_token_id: 3,
            decoder_start_token_id: 1,
            scale_embedding: true,
            doc_type_size: None,
        }
    }
}

/// Combined configuration for the full encoder-decoder model.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct EncoderDecoderConfig {
    pub encoder: BigBirdConfig,
    pub decoder: BartConfig,
    /// Total number of optimisation steps the scheduled-sampling curriculum
    /// is stretched over. None keeps the decoder teacher-forced for the whole
    /// run.
    #[serde(default)]
    pub num_training_steps: Option<usize>,
    /// Seed for the scheduled-sampling draw and decoder LayerDrop.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Whether the authoritative decode pass after a free-running preview
    /// runs with dropout/LayerDrop enabled. The reference training recipe
    /// leaves the decoder in eval mode for that pass, hence `false`.
    #[serde(default)]
    pub free_running_train_second_pass: bool,
}

impl EncoderDecoderConfig {
    pub fn new(encoder: BigBirdConfig, decoder: BartConfig) -> Self {
        Self {
            encoder,
            decoder,
            num_training_steps: None,
            seed: default_seed(),
            free_running_train_second_pass: false,
        }
    }

    /// Validate cross-field constraints before building a model.
    pub fn validate(&self) -> Result<()> {
        if self.encoder.block_size == 0 {
            candle::bail!("block_size must be non-zero")
        }
        if self.encoder.hidden_size % self.encoder.num_attention_heads != 0 {
            candle::bail!(
                "encoder hidden_size {} is not divisible by num_attention_heads {}",
                self.encoder.hidden_size,
                self.encoder.num_attention_heads
            )
        }
        if self.decoder.d_model % self.decoder.decoder_attention_heads != 0 {
            candle::bail!(
                "decoder d_model {} is not divisible by decoder_attention_heads {}",
                self.decoder.d_model,
                self.decoder.decoder_attention_heads
            )
        }
        if self.encoder.hidden_size != self.decoder.d_model
            && self.decoder.vocab_size < self.encoder.vocab_size
        {
            candle::bail!(
                "decoder vocab_size {} cannot be smaller than encoder vocab_size {} when the embedding table is not shared: decoder inputs and labels use the encoder vocabulary",
                self.decoder.vocab_size,
                self.encoder.vocab_size
            )
        }
        if self.encoder.doc_type_size == Some(0) || self.decoder.doc_type_size == Some(0) {
            candle::bail!("doc_type_size must be None or greater than zero")
        }
        if let Some(0) = self.num_training_steps {
            candle::bail!("num_training_steps must be None or greater than zero")
        }
        if !(0. ..=1.).contains(&self.decoder.decoder_layerdrop) {
            candle::bail!(
                "decoder_layerdrop must lie in [0, 1], got {}",
                self.decoder.decoder_layerdrop
            )
        }
        Ok(())
    }
}
