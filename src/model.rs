//! Top-level encoder-decoder model with scheduled sampling and the LM head.

use candle::{DType, Result, Tensor, D};
use candle_nn::{linear_no_bias, ops::log_softmax, Linear, Module, VarBuilder};

use crate::config::EncoderDecoderConfig;
use crate::decode::{BartDecoder, DecodeOptions};
use crate::encode::{BigBirdEncoder, EncodeOptions};
use crate::sampling::{top_k_embedding_mix, SamplingDecision, ScheduledSamplingController};

/// Label positions carrying this value are excluded from the loss.
pub const LOSS_IGNORE_INDEX: i64 = -100;

/// Shift labels one position to the right, inserting the decoder start token
/// and replacing any ignored-label markers by the pad token.
pub fn shift_tokens_right(
    labels: &Tensor,
    pad_token_id: u32,
    decoder_start_token_id: u32,
) -> Result<Tensor> {
    let (b_sz, seq_len) = labels.dims2()?;
    let labels = labels.to_dtype(DType::I64)?;
    let start = Tensor::full(
        decoder_start_token_id as i64,
        (b_sz, 1),
        labels.device(),
    )?;
    let shifted = Tensor::cat(&[&start, &labels.narrow(1, 0, seq_len - 1)?], 1)?;
    let pad = Tensor::full(pad_token_id as i64, (b_sz, seq_len), labels.device())?;
    shifted.eq(LOSS_IGNORE_INDEX)?.where_cond(&pad, &shifted)
}

/// Token-level cross entropy with the `-100` ignore convention: masked
/// positions contribute nothing and the mean runs over the remaining ones.
fn cross_entropy_ignore_index(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((b_sz * seq_len, vocab_size))?;
    let labels = labels.to_dtype(DType::I64)?.reshape(b_sz * seq_len)?;

    let valid = labels.ne(LOSS_IGNORE_INDEX)?;
    let num_valid = valid.to_dtype(DType::F32)?.sum_all()?;
    if num_valid.to_scalar::<f32>()? == 0. {
        candle::bail!("cannot compute a loss: every label position is ignored")
    }

    // Ignored positions are gathered at index 0 and masked out afterwards.
    let safe_labels = (valid.to_dtype(DType::I64)? * &labels)?;
    let log_probs = log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let picked = (picked * valid.to_dtype(DType::F32)?)?;
    ((picked.sum_all()? * -1.)? / num_valid)
}

/// Per-call inputs of the seq2seq forward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardArgs<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub token_type_ids: Option<&'a Tensor>,
    pub doc_type_ids: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    pub decoder_input_ids: Option<&'a Tensor>,
    pub decoder_attention_mask: Option<&'a Tensor>,
    pub decoder_doc_type_ids: Option<&'a Tensor>,
    pub decoder_inputs_embeds: Option<&'a Tensor>,
    /// Precomputed encoder hidden states; skips the encoder call entirely.
    pub encoder_outputs: Option<&'a Tensor>,
    /// Shape (batch, tgt_len), i64 with -100 for ignored positions.
    pub labels: Option<&'a Tensor>,
    pub head_mask: Option<&'a Tensor>,
    pub decoder_head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
    pub use_cache: bool,
    pub train: bool,
}

/// Output of a forward call.
#[derive(Debug, Clone)]
pub struct Seq2SeqOutput {
    pub loss: Option<Tensor>,
    /// (batch, tgt_len, encoder vocab size)
    pub logits: Tensor,
    pub encoder_last_hidden_state: Tensor,
    /// Which scheduled-sampling branch this call took.
    pub sampling_decision: SamplingDecision,
}

/// KoBigBird-BART: BigBird encoder, BART decoder, shared embedding table and
/// a scheduled-sampling training curriculum.
pub struct KoBigBirdBartModel {
    encoder: BigBirdEncoder,
    decoder: BartDecoder,
    enc_to_dec_proj: Option<Linear>,
    lm_head: Linear,
    final_logits_bias: Tensor,
    controller: ScheduledSamplingController,
    free_running_train_second_pass: bool,
    pad_token_id: u32,
    decoder_start_token_id: u32,
    d_model: usize,
    span: tracing::Span,
}

impl KoBigBirdBartModel {
    pub fn load(vb: VarBuilder, cfg: &EncoderDecoderConfig) -> Result<Self> {
        cfg.validate()?;
        let encoder = BigBirdEncoder::load(vb.pp("encoder"), &cfg.encoder, false)?;

        // The decoder reuses the encoder's word-embedding table when the
        // hidden sizes line up; the LM head is sized to the encoder
        // vocabulary accordingly.
        let shared = (cfg.encoder.hidden_size == cfg.decoder.d_model)
            .then(|| encoder.word_embeddings().clone());
        let decoder = BartDecoder::load(
            vb.pp("decoder"),
            &cfg.decoder,
            shared,
            cfg.decoder.d_model,
            cfg.seed.wrapping_add(1),
        )?;

        let enc_to_dec_proj = if cfg.encoder.hidden_size != cfg.decoder.d_model {
            Some(linear_no_bias(
                cfg.encoder.hidden_size,
                cfg.decoder.d_model,
                vb.pp("enc_to_dec_proj"),
            )?)
        } else {
            None
        };

        let lm_head = linear_no_bias(cfg.decoder.d_model, cfg.encoder.vocab_size, vb.pp("lm_head"))?;
        let final_logits_bias = vb.get_with_hints(
            (1, cfg.encoder.vocab_size),
            "final_logits_bias",
            candle_nn::Init::Const(0.),
        )?;

        Ok(Self {
            encoder,
            decoder,
            enc_to_dec_proj,
            lm_head,
            final_logits_bias,
            controller: ScheduledSamplingController::new(cfg.num_training_steps, cfg.seed),
            free_running_train_second_pass: cfg.free_running_train_second_pass,
            pad_token_id: cfg.decoder.pad_token_id,
            decoder_start_token_id: cfg.decoder.decoder_start_token_id,
            d_model: cfg.decoder.d_model,
            span: tracing::span!(tracing::Level::TRACE, "seq2seq"),
        })
    }

    pub fn encoder(&self) -> &BigBirdEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &BartDecoder {
        &self.decoder
    }

    pub fn controller(&self) -> &ScheduledSamplingController {
        &self.controller
    }

    /// Run only the encoder (plus the optional projection), e.g. once per
    /// generation request.
    pub fn encode(
        &mut self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        opts: &EncodeOptions,
    ) -> Result<Tensor> {
        let out = self.encoder.forward(input_ids, inputs_embeds, opts)?;
        match &self.enc_to_dec_proj {
            Some(proj) => out.last_hidden_state.apply(proj),
            None => Ok(out.last_hidden_state),
        }
    }

    fn project_logits(&self, decoder_hidden_states: &Tensor) -> Result<Tensor> {
        decoder_hidden_states
            .apply(&self.lm_head)?
            .broadcast_add(&self.final_logits_bias)
    }

    pub fn forward(&mut self, args: &ForwardArgs) -> Result<Seq2SeqOutput> {
        let span = self.span.clone();
        let _enter = span.enter();
        let encoder_last_hidden_state = match args.encoder_outputs {
            Some(encoder_outputs) => encoder_outputs.clone(),
            None => {
                let opts = EncodeOptions {
                    attention_mask: args.attention_mask,
                    token_type_ids: args.token_type_ids,
                    doc_type_ids: args.doc_type_ids,
                    position_ids: args.position_ids,
                    head_mask: args.head_mask,
                    train: args.train,
                };
                self.encode(args.input_ids, args.inputs_embeds, &opts)?
            }
        };

        // Default decoder inputs: labels shifted right by one position.
        let shifted;
        let decoder_input_ids = match (args.decoder_input_ids, args.decoder_inputs_embeds) {
            (None, None) => match args.labels {
                Some(labels) => {
                    shifted = shift_tokens_right(
                        labels,
                        self.pad_token_id,
                        self.decoder_start_token_id,
                    )?;
                    Some(&shifted)
                }
                None => candle::bail!(
                    "either decoder_input_ids, decoder_inputs_embeds or labels must be specified"
                ),
            },
            (ids, _) => ids,
        };

        let decode_opts = DecodeOptions {
            attention_mask: args.decoder_attention_mask,
            doc_type_ids: args.decoder_doc_type_ids,
            head_mask: args.decoder_head_mask,
            cross_attn_head_mask: args.cross_attn_head_mask,
            use_cache: args.use_cache,
            train: args.train,
        };

        // The scheduled-sampling branch only applies to training calls fed
        // with token ids; caller-provided embeddings are used verbatim.
        let mut sampling_decision = SamplingDecision::TeacherForced;
        if args.train && decoder_input_ids.is_some() {
            sampling_decision = self.controller.decide();
        }

        let decoder_hidden_states = match (sampling_decision, decoder_input_ids) {
            (SamplingDecision::TeacherForced, decoder_input_ids) => self.decoder.forward(
                decoder_input_ids,
                args.decoder_inputs_embeds,
                Some(&encoder_last_hidden_state),
                args.attention_mask,
                &decode_opts,
            )?,
            (SamplingDecision::FreeRunning, None) => {
                candle::bail!("free-running decoding requires decoder input ids")
            }
            (SamplingDecision::FreeRunning, Some(decoder_input_ids)) => {
                // Preliminary pass: eval mode, detached from the graph.
                let preview_opts = DecodeOptions {
                    train: false,
                    use_cache: false,
                    ..decode_opts.clone()
                };
                let preview = self.decoder.forward(
                    Some(decoder_input_ids),
                    None,
                    Some(&encoder_last_hidden_state),
                    args.attention_mask,
                    &preview_opts,
                )?;
                let preview_logits = self.project_logits(&preview)?.detach();

                let teacher_forced = self.decoder.embed_tokens().forward(decoder_input_ids)?;
                let mixed = top_k_embedding_mix(
                    &preview_logits,
                    &teacher_forced,
                    self.decoder.embed_tokens(),
                    self.d_model,
                )?;

                let second_opts = DecodeOptions {
                    train: self.free_running_train_second_pass,
                    use_cache: false,
                    ..decode_opts
                };
                self.decoder.forward(
                    None,
                    Some(&mixed),
                    Some(&encoder_last_hidden_state),
                    args.attention_mask,
                    &second_opts,
                )?
            }
        };

        let logits = self.project_logits(&decoder_hidden_states)?;
        let loss = match args.labels {
            Some(labels) => Some(cross_entropy_ignore_index(&logits, labels)?),
            None => None,
        };

        Ok(Seq2SeqOutput {
            loss,
            logits,
            encoder_last_hidden_state,
            sampling_decision,
        })
    }

    /// Labels shifted right, as used for default decoder inputs.
    pub fn prepare_decoder_input_ids_from_labels(&self, labels: &Tensor) -> Result<Tensor> {
        shift_tokens_right(labels, self.pad_token_id, self.decoder_start_token_id)
    }

    /// During incremental decoding, only the newest token is fed to the
    /// decoder; earlier positions live in the KV-cache.
    pub fn prepare_inputs_for_generation(&self, decoder_input_ids: &Tensor) -> Result<Tensor> {
        if self.decoder.past_kv_len() > 0 {
            let seq_len = decoder_input_ids.dim(1)?;
            decoder_input_ids.narrow(1, seq_len - 1, 1)
        } else {
            Ok(decoder_input_ids.clone())
        }
    }

    /// Reindex the decoder self-attention caches after a beam-search step.
    /// Cross-attention caches only depend on the encoder output and are left
    /// alone.
    pub fn reorder_cache(&mut self, beam_idx: &Tensor) -> Result<()> {
        self.decoder.reorder_cache(beam_idx)
    }

    /// Clear all decoder caches, e.g. between generation requests.
    pub fn reset_kv_cache(&mut self) {
        self.decoder.reset_kv_cache();
    }

    pub fn final_logits_bias(&self) -> &Tensor {
        &self.final_logits_bias
    }

    /// Truncate or zero-extend the final-logits bias after a vocabulary
    /// resize.
    pub fn resize_final_logits_bias(&mut self, new_num_tokens: usize) -> Result<()> {
        let old_num_tokens = self.final_logits_bias.dim(1)?;
        self.final_logits_bias = if new_num_tokens <= old_num_tokens {
            self.final_logits_bias.narrow(1, 0, new_num_tokens)?
        } else {
            let extra = Tensor::zeros(
                (1, new_num_tokens - old_num_tokens),
                self.final_logits_bias.dtype(),
                self.final_logits_bias.device(),
            )?;
            Tensor::cat(&[&self.final_logits_bias, &extra], 1)?
        };
        Ok(())
    }
}
