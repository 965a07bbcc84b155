//! Property-based test generators using proptest.
//!
//! Scripts draw ids from a small pool so that creates, updates and deletes
//! of the same record interleave often.

use proptest::prelude::*;
use serde_json::{json, Value};

/// Ids used by generated scripts.
pub const ID_POOL: [&str; 3] = ["a", "b", "c"];

/// One client call in a generated script.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationStep {
    /// `create_record({id, price})`.
    Create {
        /// Record id.
        id: String,
        /// Price field.
        price: u32,
    },
    /// `update_record(id, {price})`.
    Update {
        /// Record id.
        id: String,
        /// New price.
        price: u32,
    },
    /// `delete_record(id)`.
    Delete {
        /// Record id.
        id: String,
    },
}

impl MutationStep {
    /// Returns the target id.
    pub fn id(&self) -> &str {
        match self {
            MutationStep::Create { id, .. }
            | MutationStep::Update { id, .. }
            | MutationStep::Delete { id } => id,
        }
    }

    /// Returns the payload or patch the step sends, if any.
    pub fn body(&self) -> Option<Value> {
        match self {
            MutationStep::Create { id, price } => Some(json!({"id": id, "price": price})),
            MutationStep::Update { price, .. } => Some(json!({"price": price})),
            MutationStep::Delete { .. } => None,
        }
    }
}

/// Strategy for ids from [`ID_POOL`].
pub fn pool_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(ID_POOL.to_vec()).prop_map(str::to_string)
}

/// Strategy for a single step.
pub fn mutation_step_strategy() -> impl Strategy<Value = MutationStep> {
    prop_oneof![
        2 => (pool_id_strategy(), 0..1_000u32)
            .prop_map(|(id, price)| MutationStep::Create { id, price }),
        2 => (pool_id_strategy(), 0..1_000u32)
            .prop_map(|(id, price)| MutationStep::Update { id, price }),
        1 => pool_id_strategy().prop_map(|id| MutationStep::Delete { id }),
    ]
}

/// Strategy for scripts of up to `max_len` steps.
pub fn mutation_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<MutationStep>> {
    prop::collection::vec(mutation_step_strategy(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn scripts_stay_in_pool(script in mutation_script_strategy(12)) {
            prop_assert!(script.len() <= 12);
            for step in &script {
                prop_assert!(ID_POOL.contains(&step.id()));
            }
        }
    }

    #[test]
    fn bodies() {
        let create = MutationStep::Create { id: "a".into(), price: 3 };
        assert_eq!(create.body(), Some(json!({"id": "a", "price": 3})));
        assert_eq!(MutationStep::Delete { id: "a".into() }.body(), None);
    }
}
