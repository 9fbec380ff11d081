//! Turns per-token label logits into entity spans.
//!
//! Label 0 is outside. Labels 1..=8 are begin/inside pairs for MISC, PER,
//! ORG and LOC in that order, so a label's group is `(label + 1) / 2` and the
//! even labels are the inside halves.

use crate::core::model::TokenId;
use crate::core::tensor::ops::argmax;
use crate::core::tokenizer::{Piece, Vocabulary};
use crate::core::{NerError, Result};
use serde::{Deserialize, Serialize};

pub const LABEL_NAMES: [&str; 9] = ["O", "MISC", "MISC", "PER", "PER", "ORG", "ORG", "LOC", "LOC"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "entity")]
    pub text: String,
    pub label: String,
}

impl Entity {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
        }
    }
}

/// Group of a raw label index; labels outside the table count as outside.
pub fn label_group(label: usize) -> usize {
    if label == 0 || label >= LABEL_NAMES.len() {
        0
    } else {
        (label + 1) / 2
    }
}

pub fn is_inside(label: usize) -> bool {
    label_group(label) != 0 && label % 2 == 0
}

pub fn label_name(label: usize) -> &'static str {
    LABEL_NAMES.get(label).copied().unwrap_or(LABEL_NAMES[0])
}

struct OpenEntity {
    group: usize,
    entity: Entity,
}

/// Decodes `ids` with their token-major `logits` (`n_labels` per token).
pub fn decode(
    vocab: &Vocabulary,
    ids: &[TokenId],
    logits: &[f32],
    n_labels: usize,
) -> Result<Vec<Entity>> {
    let needed = ids.len() * n_labels;
    if logits.len() < needed || (n_labels == 0 && !ids.is_empty()) {
        return Err(NerError::BufferTooSmall {
            needed: needed.max(ids.len()),
            got: logits.len(),
        });
    }

    let mut entities = Vec::new();
    let mut open: Option<OpenEntity> = None;

    for (t, &id) in ids.iter().enumerate() {
        if id == vocab.bos() || id == vocab.eos() {
            continue;
        }
        let best = argmax(&logits[t * n_labels..(t + 1) * n_labels]);
        let group = label_group(best);
        let (text, continuation) = match vocab.piece(id) {
            Some(Piece::Continuation(s)) => (s.as_str(), true),
            Some(Piece::Word(s)) => (s.as_str(), false),
            None => (crate::core::tokenizer::UNK_TOKEN, false),
        };

        let continues = group != 0
            && open.as_ref().is_some_and(|o| o.group == group)
            && (is_inside(best) || continuation);

        if continues {
            if let Some(o) = open.as_mut() {
                if !continuation {
                    o.entity.text.push(' ');
                }
                o.entity.text.push_str(text);
            }
            continue;
        }

        if let Some(o) = open.take() {
            entities.push(o.entity);
        }
        if group != 0 {
            open = Some(OpenEntity {
                group,
                entity: Entity::new(text, label_name(best)),
            });
        }
    }

    if let Some(o) = open {
        entities.push(o.entity);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 9;

    fn vocab() -> Vocabulary {
        Vocabulary::from_entries([
            "[CLS]", "[SEP]", "John", "##son", "works", "at", "Acme", "Corp", "Paris", "##ian",
        ])
        .unwrap()
    }

    fn logits_for(labels: &[usize]) -> Vec<f32> {
        let mut logits = vec![0.0; labels.len() * N];
        for (t, &l) in labels.iter().enumerate() {
            logits[t * N + l] = 5.0;
        }
        logits
    }

    #[test]
    fn test_label_groups() {
        assert_eq!(label_group(0), 0);
        assert_eq!(label_group(1), 1);
        assert_eq!(label_group(2), 1);
        assert_eq!(label_group(4), 2);
        assert_eq!(label_group(8), 4);
        assert_eq!(label_group(9), 0);
        assert!(is_inside(4));
        assert!(!is_inside(3));
        assert_eq!(label_name(6), "ORG");
    }

    #[test]
    fn test_johnson() {
        let ids = [0, 2, 3, 4, 1];
        let logits = logits_for(&[0, 3, 4, 0, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(entities, vec![Entity::new("Johnson", "PER")]);
    }

    #[test]
    fn test_inside_label_joins_with_space() {
        let ids = [0, 4, 5, 6, 7, 1];
        let logits = logits_for(&[0, 0, 0, 5, 6, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(entities, vec![Entity::new("Acme Corp", "ORG")]);
    }

    #[test]
    fn test_begin_label_starts_new_entity() {
        let ids = [0, 6, 7, 1];
        let logits = logits_for(&[0, 5, 5, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(
            entities,
            vec![Entity::new("Acme", "ORG"), Entity::new("Corp", "ORG")]
        );
    }

    #[test]
    fn test_continuation_piece_extends_begin_label() {
        // "##ian" predicted as B-MISC still continues an open MISC entity
        let ids = [0, 8, 9, 1];
        let logits = logits_for(&[0, 1, 1, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(entities, vec![Entity::new("Parisian", "MISC")]);
    }

    #[test]
    fn test_group_change_closes_entity() {
        let ids = [0, 2, 8, 1];
        let logits = logits_for(&[0, 3, 8, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(
            entities,
            vec![Entity::new("John", "PER"), Entity::new("Paris", "LOC")]
        );
    }

    #[test]
    fn test_inside_without_open_entity_starts_one() {
        let ids = [2, 4];
        let logits = logits_for(&[4, 0]);
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(entities, vec![Entity::new("John", "PER")]);
    }

    #[test]
    fn test_tie_prefers_lowest_label() {
        let ids = [2];
        let logits = vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let entities = decode(&vocab(), &ids, &logits, N).unwrap();
        assert_eq!(entities, vec![Entity::new("John", "PER")]);
    }

    #[test]
    fn test_short_logits_rejected() {
        let err = decode(&vocab(), &[0, 2, 1], &[0.0; 18], N).unwrap_err();
        assert!(matches!(err, NerError::BufferTooSmall { needed: 27, got: 18 }));
    }

    #[test]
    fn test_entity_json_shape() {
        let json = serde_json::to_string(&Entity::new("Johnson", "PER")).unwrap();
        assert_eq!(json, r#"{"entity":"Johnson","label":"PER"}"#);
    }
}
