//! Narrow interface over the conflict-free replicated document.
//!
//! Merge semantics belong to the replica implementation. The rest of the
//! crate only moves opaque update and state-vector bytes through this trait.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

/// Replica errors.
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("undecodable update: {0}")]
    InvalidUpdate(String),
    #[error("undecodable state vector: {0}")]
    InvalidStateVector(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

/// A conflict-free replicated value.
///
/// Applying the same set of updates in any order, with duplicates, must
/// converge to the same state.
pub trait Mergeable: Send + Sync + 'static {
    fn apply_update(&self, update: &[u8]) -> Result<(), MergeError>;

    /// Full state, suitable for persistence or for a peer with no state.
    fn encode_state_as_update(&self) -> Vec<u8>;

    fn encode_state_vector(&self) -> Vec<u8>;

    /// Only the operations missing from `state_vector`.
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError>;
}

/// Factory used by the document store to create empty replicas.
pub type ReplicaFactory = std::sync::Arc<dyn Fn() -> Box<dyn Mergeable> + Send + Sync>;

/// Default factory producing [`YrsDocument`] replicas.
pub fn yrs_factory() -> ReplicaFactory {
    std::sync::Arc::new(|| Box::new(YrsDocument::new()) as Box<dyn Mergeable>)
}

/// [`Mergeable`] backed by a Yrs `Doc` (v1 update encoding).
pub struct YrsDocument {
    doc: yrs::Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    pub fn from_doc(doc: yrs::Doc) -> Self {
        Self { doc }
    }

    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Mergeable for YrsDocument {
    fn apply_update(&self, update: &[u8]) -> Result<(), MergeError> {
        let update =
            Update::decode_v1(update).map_err(|e| MergeError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Rejected(e.to_string()))
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| MergeError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use yrs::updates::decoder::Decode;
    use yrs::{GetString, Text, WriteTxn};

    fn edit(doc: &yrs::Doc, index: u32, chunk: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, index, chunk);
        }
        doc.transact().encode_diff_v1(&before)
    }

    fn text_of(doc: &YrsDocument) -> String {
        let txn = doc.doc().transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_full_state_roundtrip() {
        let source = yrs::Doc::new();
        edit(&source, 0, "hello");
        let full = source.transact().encode_state_as_update_v1(&StateVector::default());

        let replica = YrsDocument::new();
        replica.apply_update(&full).unwrap();
        assert_eq!(text_of(&replica), "hello");
    }

    #[test]
    fn test_convergence_under_reordering_and_duplication() {
        let a = yrs::Doc::new();
        let b = yrs::Doc::new();
        let u1 = edit(&a, 0, "abc");
        let u2 = edit(&b, 0, "xyz");
        let u3 = edit(&a, 1, "--");

        let left = YrsDocument::new();
        for u in [&u1, &u2, &u3] {
            left.apply_update(u).unwrap();
        }

        let right = YrsDocument::new();
        for u in [&u3, &u2, &u2, &u1, &u3, &u1] {
            right.apply_update(u).unwrap();
        }

        assert_eq!(text_of(&left), text_of(&right));
        assert_eq!(left.encode_state_vector(), right.encode_state_vector());
        assert_eq!(left.encode_state_as_update(), right.encode_state_as_update());
    }

    /// Edits from three clients, some concurrent and some causally ordered.
    fn concurrent_updates() -> Vec<Vec<u8>> {
        let a = yrs::Doc::new();
        let b = yrs::Doc::new();
        let c = yrs::Doc::new();
        let u1 = edit(&a, 0, "abc");
        let u2 = edit(&b, 0, "xyz");
        let u3 = edit(&a, 1, "--");
        let u4 = edit(&b, 0, "..");
        for u in [&u1, &u2] {
            let update = yrs::Update::decode_v1(u).unwrap();
            c.transact_mut().apply_update(update).unwrap();
        }
        let u5 = edit(&c, 2, "##");
        vec![u1, u2, u3, u4, u5]
    }

    proptest! {
        #[test]
        fn test_any_delivery_order_converges(
            order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
            duplicates in proptest::collection::vec(0..5usize, 0..5),
        ) {
            let updates = concurrent_updates();
            let reference = YrsDocument::new();
            for update in &updates {
                reference.apply_update(update).unwrap();
            }

            let replica = YrsDocument::new();
            for i in order.iter().chain(duplicates.iter()) {
                replica.apply_update(&updates[*i]).unwrap();
            }
            prop_assert_eq!(text_of(&replica), text_of(&reference));
            prop_assert_eq!(
                replica.encode_state_as_update(),
                reference.encode_state_as_update()
            );
        }
    }

    #[test]
    fn test_diff_is_minimal() {
        let source = yrs::Doc::new();
        edit(&source, 0, &"x".repeat(10_000));
        let server = YrsDocument::from_doc(source.clone());

        let client = YrsDocument::new();
        client.apply_update(&server.encode_state_as_update()).unwrap();
        let stale = client.encode_state_vector();

        edit(&source, 0, "!");
        let diff = server.encode_diff(&stale).unwrap();
        assert!(diff.len() < 100, "diff of {} bytes is not minimal", diff.len());

        client.apply_update(&diff).unwrap();
        assert_eq!(text_of(&client), text_of(&server));
    }

    #[test]
    fn test_empty_state_vector_yields_full_state() {
        let source = yrs::Doc::new();
        edit(&source, 0, "everything");
        let server = YrsDocument::from_doc(source);

        let empty = StateVector::default().encode_v1();
        assert_eq!(server.encode_diff(&empty).unwrap(), server.encode_state_as_update());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let replica = YrsDocument::new();
        assert!(replica.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
        assert!(replica.encode_diff(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
