use ner_engine::core::model::registry::{CLASSIFIER_BIAS, WORD_EMBEDDINGS};
use ner_engine::core::model::TensorRegistry;
use ner_engine::{
    decode, Context, DType, HParams, HParamsBuilder, ModelWriter, NerError, NerService, QuantKind,
    Vocabulary,
};
use std::path::PathBuf;

const VOCAB: [&str; 12] = [
    "[PAD]", "[CLS]", "[SEP]", "[UNK]", "hello", "world", "play", "##ing", "John", "##son",
    "works", "a",
];

/// Temp file removed on drop.
struct TempModel(PathBuf);

impl TempModel {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("ner-{}.bin", uuid::Uuid::new_v4())))
    }
}

impl Drop for TempModel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn hparams(quant: QuantKind, max_tokens: usize) -> HParams {
    HParamsBuilder::new()
        .n_vocab(VOCAB.len())
        .max_tokens(max_tokens)
        .embedding(32)
        .intermediate(64)
        .heads(4)
        .layers(2)
        .quant(quant)
        .build()
        .unwrap()
}

fn values(name: &str, n: usize) -> Vec<f32> {
    if name.ends_with("LayerNorm.weight") {
        return vec![1.0; n];
    }
    let seed = name.bytes().fold(7u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    (0..n)
        .map(|i| ((seed as usize + i * 7919) % 1009) as f32 / 1009.0 - 0.5)
        .map(|v| v * 0.2)
        .collect()
}

fn writer(hp: HParams) -> ModelWriter {
    ModelWriter::new(hp)
        .vocab(VOCAB)
        .all_tensors(values)
        .unwrap()
}

fn save(writer: &ModelWriter) -> TempModel {
    let file = TempModel::new();
    writer.save(&file.0).unwrap();
    file
}

fn context(quant: QuantKind, max_tokens: usize) -> Context {
    let bytes = writer(hparams(quant, max_tokens)).to_bytes().unwrap();
    Context::load_from_reader(&bytes[..]).unwrap()
}

#[test]
fn test_header_round_trip() {
    let hp = hparams(QuantKind::F16, 16);
    let file = save(&writer(hp.clone()));
    let ctx = Context::load(&file.0).unwrap();

    assert_eq!(ctx.hparams(), &hp);
    assert_eq!(ctx.n_embd(), 32);
    assert_eq!(ctx.n_max_tokens(), 16);
    assert_eq!(ctx.n_labels(), 9);
    assert_eq!(ctx.vocab().len(), VOCAB.len());
    assert_eq!(ctx.token_text(9), "##son");
}

#[test]
fn test_tokenize_words_and_pieces() {
    let ctx = context(QuantKind::F32, 16);
    let hello = ctx.tokenize("hello world", 16);
    assert_eq!(hello.ids, vec![1, 4, 5, 2]);
    assert!(!hello.truncated);

    let playing = ctx.tokenize("playing", 16);
    assert_eq!(playing.ids, vec![1, 6, 7, 2]);
    assert!(ctx.vocab().is_continuation(playing.ids[2]));
}

#[test]
fn test_decode_merges_subword_entity() {
    let vocab = Vocabulary::from_entries(VOCAB).unwrap();
    let ids = [1, 8, 9, 10, 2];
    let labels = [0, 3, 4, 0, 0];
    let mut logits = vec![0.0f32; ids.len() * 9];
    for (t, &l) in labels.iter().enumerate() {
        logits[t * 9 + l] = 5.0;
    }

    let entities = decode(&vocab, &ids, &logits, 9).unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].text, "Johnson");
    assert_eq!(entities[0].label, "PER");
    assert_eq!(
        serde_json::to_string(&entities).unwrap(),
        r#"[{"entity":"Johnson","label":"PER"}]"#
    );
}

#[test]
fn test_thread_count_is_invisible() {
    for quant in [QuantKind::F32, QuantKind::F16, QuantKind::Q4_0] {
        let ctx = context(quant, 16);
        let ids = ctx.tokenize("hello world playing John works", 16).ids;
        let one = ctx.evaluate(1, &ids).unwrap();
        let four = ctx.evaluate(4, &ids).unwrap();
        assert_eq!(one.len(), ids.len() * 9);
        for (a, b) in one.iter().zip(&four) {
            assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0), "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_truncation_boundary() {
    let max_tokens = 6;
    let file = save(&writer(hparams(QuantKind::F32, max_tokens)));
    let service = NerService::new(2);
    service.load(&file.0).unwrap();

    let ctx = service.slot().current().unwrap();
    let fits = ctx.tokenize("a a a a", max_tokens);
    assert_eq!(fits.ids.len(), max_tokens);
    assert!(!fits.truncated);
    let over = ctx.tokenize("a a a a a", max_tokens);
    assert_eq!(over.ids.len(), max_tokens);
    assert!(over.truncated);

    let rows = [Some("a a a a"), Some("a a a a a")];
    let strict = service.invoke("ner", &rows, Some(false)).unwrap();
    assert!(strict[0].is_ok());
    assert!(matches!(
        strict[1],
        Err(NerError::TokenOverflow { capacity }) if capacity == max_tokens
    ));

    let lenient = service.invoke("ner_extract", &rows, Some(true)).unwrap();
    assert!(lenient.iter().all(|r| matches!(r, Ok(Some(_)))));
}

#[test]
fn test_no_residue_between_calls() {
    let ctx = context(QuantKind::F32, 16);
    let first = ctx.tokenize("John works", 16).ids;
    let second = ctx.tokenize("hello world", 16).ids;

    ctx.evaluate(2, &first).unwrap();
    let reused = ctx.evaluate(2, &second).unwrap();
    let fresh = context(QuantKind::F32, 16).evaluate(2, &second).unwrap();
    assert_eq!(reused, fresh);
}

#[test]
fn test_unknown_tensor_is_skipped() {
    let bytes = writer(hparams(QuantKind::F32, 16))
        .tensor("pooler.dense.weight", DType::F32, &[4, 2], &[0.5; 8])
        .unwrap()
        .to_bytes()
        .unwrap();
    let ctx = Context::load_from_reader(&bytes[..]).unwrap();
    assert_eq!(ctx.vocab().len(), VOCAB.len());
}

#[test]
fn test_mismatched_tensor_fails() {
    let bytes = writer(hparams(QuantKind::F32, 16))
        .tensor(CLASSIFIER_BIAS, DType::F32, &[3], &[0.0; 3])
        .unwrap()
        .to_bytes()
        .unwrap();
    let err = Context::load_from_reader(&bytes[..]).unwrap_err();
    assert!(matches!(err, NerError::TensorMismatch { ref name, .. } if name == CLASSIFIER_BIAS));
}

#[test]
fn test_truncated_header_is_format_error() {
    let bytes = writer(hparams(QuantKind::F32, 16)).to_bytes().unwrap();
    let err = Context::load_from_reader(&bytes[..20]).unwrap_err();
    assert!(err.is_format(), "{}", err);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = Context::load("/nonexistent/dir/model.bin").unwrap_err();
    assert!(err.is_io(), "{}", err);
}

#[test]
fn test_failed_swap_keeps_model() {
    let file = save(&writer(hparams(QuantKind::F32, 16)));
    let service = NerService::new(1);
    service.set_option("ner_model_path", file.0.to_str().unwrap()).unwrap();
    let before = service.slot().current().unwrap();

    let bad = TempModel::new();
    std::fs::write(&bad.0, b"not a model").unwrap();
    assert!(service.set_option("ner_model_path", bad.0.to_str().unwrap()).is_err());
    assert!(std::sync::Arc::ptr_eq(&before, &service.slot().current().unwrap()));

    let out = service.invoke("ner", &[None, Some("hello")], None).unwrap();
    assert!(matches!(out[0], Ok(None)));
    assert!(matches!(out[1], Ok(Some(_))));
}

#[test]
fn test_no_model_returns_empty_lists() {
    let service = NerService::new(1);
    let out = service.invoke("ner", &[Some("John works"), None], None).unwrap();
    assert!(matches!(&out[0], Ok(Some(v)) if v.is_empty()));
    assert!(matches!(out[1], Ok(None)));
    assert!(matches!(
        service.invoke("sentiment", &[], None),
        Err(NerError::UnknownFunction(_))
    ));
    assert!(matches!(
        service.set_option("ner_threads", "4"),
        Err(NerError::UnknownOption(_))
    ));
}

#[test]
fn test_quantized_weights_match_writer_input() {
    for (quant, tolerance) in [(QuantKind::F16, 1e-3), (QuantKind::Q4_0, 0.1 / 8.0 + 1e-2)] {
        let ctx = context(quant, 16);
        let stored = ctx.model().weights().word_embeddings.to_f32_vec();
        let expected = values(WORD_EMBEDDINGS, stored.len());
        for (s, e) in stored.iter().zip(&expected) {
            assert!((s - e).abs() <= tolerance, "{:?}: {} vs {}", quant, s, e);
        }
    }
}

#[test]
fn test_f32_records_load_under_q4_0_header() {
    let hp = hparams(QuantKind::Q4_0, 16);
    let registry = TensorRegistry::for_hparams(&hp);
    let mut widened = ModelWriter::new(hp.clone()).vocab(VOCAB);
    for name in registry.names() {
        let dims = registry.get(name).unwrap().shape().dims().to_vec();
        let n = dims.iter().product();
        widened = widened.tensor(name, DType::F32, &dims, &values(name, n)).unwrap();
    }

    let ctx = Context::load_from_reader(&widened.to_bytes().unwrap()[..]).unwrap();
    assert_eq!(ctx.model().weights().word_embeddings.dtype(), DType::Q4_0);

    let native = context(QuantKind::Q4_0, 16);
    let ids = ctx.tokenize("John works in hello world", 16).ids;
    assert_eq!(ctx.evaluate(2, &ids).unwrap(), native.evaluate(2, &ids).unwrap());
}

#[test]
fn test_oversized_header_fails_without_disturbing_model() {
    let file = save(&writer(hparams(QuantKind::F32, 16)));
    let service = NerService::new(1);
    service.load(&file.0).unwrap();
    let before = service.slot().current().unwrap();

    let hostile = TempModel::new();
    let mut bytes = ner_engine::MODEL_MAGIC.to_le_bytes().to_vec();
    for field in [2i32, i32::MAX, 1 << 30, 64, 2, 1, 0, 9] {
        bytes.extend_from_slice(&field.to_le_bytes());
    }
    for entry in ["[CLS]", "[SEP]"] {
        bytes.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        bytes.extend_from_slice(entry.as_bytes());
    }
    std::fs::write(&hostile.0, &bytes).unwrap();

    let err = service.load(&hostile.0).unwrap_err();
    assert!(err.is_format(), "{}", err);
    assert!(std::sync::Arc::ptr_eq(&before, &service.slot().current().unwrap()));
}
