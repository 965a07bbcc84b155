//! Online reference model.
//!
//! [`apply_online`] replays a script the way the client treats it when
//! every call reaches the remote service immediately, and predicts the
//! resulting synced records.

use crate::generators::MutationStep;
use std::collections::BTreeMap;

/// Predicted state of one synced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRecord {
    /// Last written price.
    pub price: u32,
    /// Server revision: writes since the record was last created.
    pub revision: u64,
}

/// Outcome of applying a script to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelState {
    /// Live records by id.
    pub records: BTreeMap<String, ModelRecord>,
    /// Indexes of steps the client rejects.
    pub rejected: Vec<usize>,
}

/// Applies `script` as if every call were confirmed immediately.
///
/// Creating a live id, and updating or deleting a missing one, are
/// rejected and leave the state unchanged.
pub fn apply_online(script: &[MutationStep]) -> ModelState {
    let mut state = ModelState::default();
    for (index, step) in script.iter().enumerate() {
        match step {
            MutationStep::Create { id, price } => {
                if state.records.contains_key(id) {
                    state.rejected.push(index);
                } else {
                    state.records.insert(
                        id.clone(),
                        ModelRecord {
                            price: *price,
                            revision: 1,
                        },
                    );
                }
            }
            MutationStep::Update { id, price } => match state.records.get_mut(id) {
                Some(record) => {
                    record.price = *price;
                    record.revision += 1;
                }
                None => state.rejected.push(index),
            },
            MutationStep::Delete { id } => {
                if state.records.remove(id).is_none() {
                    state.rejected.push(index);
                }
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(id: &str, price: u32) -> MutationStep {
        MutationStep::Create {
            id: id.into(),
            price,
        }
    }

    #[test]
    fn counts_revisions_per_lifetime() {
        let script = vec![
            create("a", 1),
            MutationStep::Update {
                id: "a".into(),
                price: 2,
            },
            MutationStep::Delete { id: "a".into() },
            create("a", 3),
        ];
        let state = apply_online(&script);
        assert_eq!(
            state.records["a"],
            ModelRecord {
                price: 3,
                revision: 1
            }
        );
        assert!(state.rejected.is_empty());
    }

    #[test]
    fn rejects_invalid_steps() {
        let script = vec![
            MutationStep::Delete { id: "a".into() },
            create("a", 1),
            create("a", 2),
        ];
        let state = apply_online(&script);
        assert_eq!(state.rejected, vec![0, 2]);
        assert_eq!(state.records["a"].price, 1);
    }
}
