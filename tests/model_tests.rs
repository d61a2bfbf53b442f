use anyhow::Result;
use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};

use kobigbird_bart::{
    AttentionType, BartConfig, BigBirdConfig, EncoderDecoderConfig, ForwardArgs,
    KoBigBirdBartModel, SamplingDecision,
};

fn tiny_config() -> EncoderDecoderConfig {
    let encoder = BigBirdConfig {
        vocab_size: 32,
        hidden_size: 8,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        hidden_dropout_prob: 0.0,
        max_position_embeddings: 128,
        type_vocab_size: 2,
        layer_norm_eps: 1e-12,
        pad_token_id: 0,
        attention_type: AttentionType::BlockSparse,
        block_size: 4,
        num_random_blocks: 1,
        rescale_embeddings: false,
        doc_type_size: None,
    };
    let decoder = BartConfig {
        vocab_size: 32,
        d_model: 8,
        decoder_layers: 2,
        decoder_attention_heads: 2,
        decoder_ffn_dim: 16,
        activation_function: candle_nn::Activation::Gelu,
        max_position_embeddings: 64,
        dropout: 0.0,
        decoder_layerdrop: 0.0,
        pad_token_id: 3,
        decoder_start_token_id: 1,
        scale_embedding: true,
        doc_type_size: None,
    };
    EncoderDecoderConfig::new(encoder, decoder)
}

fn model_from(varmap: &VarMap, cfg: &EncoderDecoderConfig, dev: &Device) -> Result<KoBigBirdBartModel> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, dev);
    Ok(KoBigBirdBartModel::load(vb, cfg)?)
}

#[test]
fn labels_alone_drive_the_decoder_and_the_loss() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let labels = Tensor::new(&[[2i64, 5, 7, -100]], &dev)?;
    let out = model.forward(&ForwardArgs {
        input_ids: Some(&input_ids),
        labels: Some(&labels),
        ..Default::default()
    })?;

    assert_eq!(out.logits.dims(), [1, 4, 32]);
    assert_eq!(out.encoder_last_hidden_state.dims(), [1, 6, 8]);
    let loss = out.loss.expect("labels should produce a loss").to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss > 0.);
    Ok(())
}

#[test]
fn missing_decoder_inputs_and_labels_are_rejected() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;
    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let res = model.forward(&ForwardArgs {
        input_ids: Some(&input_ids),
        ..Default::default()
    });
    assert!(res.is_err());
    Ok(())
}

#[test]
fn block_padding_is_invisible_to_the_caller() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;

    // 30 tokens exceed the (5 + 2) * 4 = 28 token budget, so the encoder runs
    // block-sparse and pads to 32 internally.
    let input_ids = Tensor::ones((1, 30), DType::U32, &dev)?;
    let attention_mask = Tensor::ones((1, 30), DType::U32, &dev)?;
    let decoder_input_ids = Tensor::new(&[[1u32, 2, 5]], &dev)?;
    let out = model.forward(&ForwardArgs {
        input_ids: Some(&input_ids),
        attention_mask: Some(&attention_mask),
        decoder_input_ids: Some(&decoder_input_ids),
        ..Default::default()
    })?;
    assert_eq!(out.encoder_last_hidden_state.dims(), [1, 30, 8]);
    assert_eq!(out.logits.dims(), [1, 3, 32]);
    Ok(())
}

#[test]
fn short_inputs_take_the_dense_fallback_end_to_end() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;

    // 5 tokens with trailing padding in the mask, well under the budget.
    let input_ids = Tensor::new(&[[4u32, 5, 6, 7, 8, 0, 0, 0]], &dev)?;
    let attention_mask = Tensor::new(&[[1u32, 1, 1, 1, 1, 0, 0, 0]], &dev)?;
    let decoder_input_ids = Tensor::new(&[[1u32, 2]], &dev)?;
    let out = model.forward(&ForwardArgs {
        input_ids: Some(&input_ids),
        attention_mask: Some(&attention_mask),
        decoder_input_ids: Some(&decoder_input_ids),
        ..Default::default()
    })?;
    assert_eq!(out.encoder_last_hidden_state.dims(), [1, 8, 8]);
    assert_eq!(out.logits.dims(), [1, 2, 32]);
    Ok(())
}

#[test]
fn unknown_curriculum_length_never_free_runs() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let labels = Tensor::new(&[[2i64, 5, 7, 9]], &dev)?;
    for _ in 0..20 {
        let out = model.forward(&ForwardArgs {
            input_ids: Some(&input_ids),
            labels: Some(&labels),
            train: true,
            ..Default::default()
        })?;
        assert_eq!(out.sampling_decision, SamplingDecision::TeacherForced);
    }
    assert_eq!(model.controller().cur_training_steps(), 0);
    Ok(())
}

#[test]
fn exhausted_curriculum_free_runs_and_still_yields_a_loss() -> Result<()> {
    let dev = Device::Cpu;
    let mut cfg = tiny_config();
    cfg.num_training_steps = Some(1);
    cfg.seed = 1234;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &cfg, &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let labels = Tensor::new(&[[2i64, 5, 7, 9]], &dev)?;
    let mut saw_free_running = false;
    for _ in 0..16 {
        let out = model.forward(&ForwardArgs {
            input_ids: Some(&input_ids),
            labels: Some(&labels),
            train: true,
            ..Default::default()
        })?;
        let loss = out.loss.expect("training call should produce a loss");
        assert!(loss.to_scalar::<f32>()?.is_finite());
        assert_eq!(out.logits.dims(), [1, 4, 32]);
        saw_free_running |= out.sampling_decision == SamplingDecision::FreeRunning;
    }
    // With the budget used up after one step, the draw wins essentially
    // always over the 16 remaining calls.
    assert!(saw_free_running);
    Ok(())
}

#[test]
fn same_weights_and_seed_give_identical_training_runs() -> Result<()> {
    let dev = Device::Cpu;
    let mut cfg = tiny_config();
    cfg.num_training_steps = Some(4);
    cfg.seed = 7;
    let varmap = VarMap::new();
    let mut model_a = model_from(&varmap, &cfg, &dev)?;
    let mut model_b = model_from(&varmap, &cfg, &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let labels = Tensor::new(&[[2i64, 5, 7, 9]], &dev)?;
    for _ in 0..6 {
        let args = ForwardArgs {
            input_ids: Some(&input_ids),
            labels: Some(&labels),
            train: true,
            ..Default::default()
        };
        let out_a = model_a.forward(&args)?;
        let out_b = model_b.forward(&args)?;
        assert_eq!(out_a.sampling_decision, out_b.sampling_decision);
        assert_eq!(
            out_a.logits.flatten_all()?.to_vec1::<f32>()?,
            out_b.logits.flatten_all()?.to_vec1::<f32>()?
        );
    }
    Ok(())
}

#[test]
fn incremental_decoding_matches_the_full_pass() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &tiny_config(), &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let attention_mask = Tensor::ones((1, 6), DType::U32, &dev)?;
    let decoder_input_ids = Tensor::new(&[[1u32, 4, 9]], &dev)?;

    let full = model.forward(&ForwardArgs {
        input_ids: Some(&input_ids),
        attention_mask: Some(&attention_mask),
        decoder_input_ids: Some(&decoder_input_ids),
        ..Default::default()
    })?;

    model.reset_kv_cache();
    let mut last_logits = None;
    for step in 1..=3usize {
        let prefix = decoder_input_ids.narrow(1, 0, step)?;
        let step_ids = model.prepare_inputs_for_generation(&prefix)?;
        assert_eq!(step_ids.dims(), [1, 1]);
        let out = model.forward(&ForwardArgs {
            input_ids: Some(&input_ids),
            attention_mask: Some(&attention_mask),
            decoder_input_ids: Some(&step_ids),
            use_cache: true,
            ..Default::default()
        })?;
        last_logits = Some(out.logits);
    }

    let incremental = last_logits
        .expect("three decode steps ran")
        .i((0, 0))?
        .to_vec1::<f32>()?;
    let reference = full.logits.i((0, 2))?.to_vec1::<f32>()?;
    for (a, b) in incremental.iter().zip(reference.iter()) {
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }
    Ok(())
}

#[test]
fn doc_type_ids_shift_the_logits() -> Result<()> {
    let dev = Device::Cpu;
    let mut cfg = tiny_config();
    cfg.encoder.doc_type_size = Some(3);
    cfg.decoder.doc_type_size = Some(3);
    let varmap = VarMap::new();
    let mut model = model_from(&varmap, &cfg, &dev)?;

    let input_ids = Tensor::ones((1, 6), DType::U32, &dev)?;
    let decoder_input_ids = Tensor::new(&[[1u32, 4]], &dev)?;
    let doc_a = Tensor::zeros((1, 6), DType::U32, &dev)?;
    let doc_b = Tensor::full(2u32, (1, 6), &dev)?;
    let dec_doc = Tensor::zeros((1, 2), DType::U32, &dev)?;

    let mut run = |doc: &Tensor| -> Result<Vec<f32>> {
        let out = model.forward(&ForwardArgs {
            input_ids: Some(&input_ids),
            decoder_input_ids: Some(&decoder_input_ids),
            doc_type_ids: Some(doc),
            decoder_doc_type_ids: Some(&dec_doc),
            ..Default::default()
        })?;
        Ok(out.logits.flatten_all()?.to_vec1::<f32>()?)
    };
    let logits_a = run(&doc_a)?;
    let logits_b = run(&doc_b)?;
    assert_ne!(logits_a, logits_b);
    Ok(())
}
