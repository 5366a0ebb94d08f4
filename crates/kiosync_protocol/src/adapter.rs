//! Translation between the logical checkpoint and endpoint wire shapes.
//!
//! Both endpoints speak the same pull/push protocol but disagree on naming:
//! the field carrying the ordering cursor and the top-level key holding
//! pulled documents are configured per endpoint in
//! [`CollectionSyncConfig`]. The adapter is the only place that knows
//! those names. Everything above it deals in [`Checkpoint`] and
//! [`PullEnvelope`].

use crate::checkpoint::{Checkpoint, Cursor};
use crate::collection::{CollectionId, CollectionSyncConfig};
use crate::document::{Document, LocalChange};
use crate::endpoint::EndpointId;
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{PullEnvelope, PullRequest, PushRequest, PushRow};
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds endpoint-correct requests and normalizes responses.
///
/// Pure: holds only static configuration.
#[derive(Debug, Clone, Default)]
pub struct CheckpointAdapter {
    collections: BTreeMap<CollectionId, CollectionSyncConfig>,
}

impl CheckpointAdapter {
    /// Creates an adapter for the given collections.
    pub fn new(collections: impl IntoIterator<Item = CollectionSyncConfig>) -> Self {
        Self {
            collections: collections
                .into_iter()
                .map(|config| (config.id.clone(), config))
                .collect(),
        }
    }

    /// Creates an adapter for a single collection.
    pub fn for_collection(config: CollectionSyncConfig) -> Self {
        Self::new([config])
    }

    /// Returns the configuration of a collection.
    pub fn config(&self, collection: &CollectionId) -> ProtocolResult<&CollectionSyncConfig> {
        self.collections
            .get(collection)
            .ok_or_else(|| ProtocolError::UnknownCollection(collection.to_string()))
    }

    /// Returns the configured collection ids.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionId> {
        self.collections.keys()
    }

    /// Builds a pull request for `endpoint`.
    ///
    /// A checkpoint issued by the other endpoint is dropped, so the request
    /// becomes a full pull instead of carrying a foreign cursor. A zero
    /// `limit` falls back to the collection's batch size.
    pub fn build_pull_request(
        &self,
        collection: &CollectionId,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
        endpoint: EndpointId,
    ) -> ProtocolResult<PullRequest> {
        let config = self.config(collection)?;
        let limit = if limit == 0 { config.batch_size } else { limit };

        Ok(PullRequest {
            collection: collection.clone(),
            endpoint,
            cursor_field: config.fields(endpoint).cursor_field.clone(),
            checkpoint: Self::rebase(checkpoint, endpoint),
            limit,
        })
    }

    /// Builds a push request from local changes.
    ///
    /// Changes with a null assumed prior state are pushed as tombstones.
    pub fn build_push_request(
        &self,
        collection: &CollectionId,
        changes: &[LocalChange],
    ) -> ProtocolResult<PushRequest> {
        self.config(collection)?;

        let rows = changes
            .iter()
            .map(|change| {
                let document = if change.is_tombstone() {
                    change.document.clone().into_tombstone()
                } else {
                    change.document.clone()
                };
                PushRow {
                    document,
                    assumed_prior: change.assumed_prior.clone(),
                }
            })
            .collect();

        Ok(PushRequest {
            collection: collection.clone(),
            rows,
        })
    }

    /// Reduces a raw pull response from `endpoint` to a [`PullEnvelope`].
    ///
    /// Fails with [`ProtocolError::ProtocolMismatch`] if the documents are
    /// not under the endpoint's documents key, a document has no id, a
    /// non-empty page has no checkpoint, or the checkpoint carries a cursor
    /// under any name other than the endpoint's cursor field.
    pub fn normalize_response(
        &self,
        collection: &CollectionId,
        raw: &Value,
        endpoint: EndpointId,
    ) -> ProtocolResult<PullEnvelope> {
        let config = self.config(collection)?;
        let fields = config.fields(endpoint);
        let peer = config.fields(endpoint.other());
        let mismatch = |reason: String| ProtocolError::mismatch(endpoint, collection.as_str(), reason);

        let object = raw
            .as_object()
            .ok_or_else(|| mismatch("response is not an object".into()))?;

        let items = match object.get(&fields.documents_key) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(mismatch(format!(
                    "'{}' is not an array",
                    fields.documents_key
                )))
            }
            None if peer.documents_key != fields.documents_key
                && object.contains_key(&peer.documents_key) =>
            {
                return Err(mismatch(format!(
                    "documents under '{}', expected '{}'",
                    peer.documents_key, fields.documents_key
                )))
            }
            None => {
                return Err(mismatch(format!(
                    "missing '{}'",
                    fields.documents_key
                )))
            }
        };

        let documents = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Document::from_wire(item)
                    .ok_or_else(|| mismatch(format!("document {index} has no string id")))
            })
            .collect::<ProtocolResult<Vec<_>>>()?;

        let checkpoint = match object.get("checkpoint") {
            None | Some(Value::Null) => {
                if !documents.is_empty() {
                    return Err(mismatch("non-empty page without checkpoint".into()));
                }
                None
            }
            Some(Value::Object(cp)) => {
                let cursor = match cp.get(&fields.cursor_field) {
                    Some(value) => Cursor::from_value(value).ok_or_else(|| {
                        mismatch(format!("'{}' is not a scalar cursor", fields.cursor_field))
                    })?,
                    None if peer.cursor_field != fields.cursor_field
                        && cp.contains_key(&peer.cursor_field) =>
                    {
                        return Err(mismatch(format!(
                            "checkpoint uses '{}', expected '{}'",
                            peer.cursor_field, fields.cursor_field
                        )))
                    }
                    None => {
                        return Err(mismatch(format!(
                            "checkpoint missing '{}'",
                            fields.cursor_field
                        )))
                    }
                };

                let id = match cp.get("id") {
                    Some(Value::String(id)) => id.clone(),
                    None | Some(Value::Null) => documents
                        .last()
                        .map(|doc| doc.id.clone())
                        .unwrap_or_default(),
                    Some(_) => return Err(mismatch("checkpoint id is not a string".into())),
                };

                Some(Checkpoint {
                    endpoint,
                    id,
                    cursor,
                })
            }
            Some(_) => return Err(mismatch("checkpoint is not an object".into())),
        };

        Ok(PullEnvelope {
            documents,
            checkpoint,
        })
    }

    /// Keeps a checkpoint only if `endpoint` issued it.
    pub fn rebase(checkpoint: Option<&Checkpoint>, endpoint: EndpointId) -> Option<Checkpoint> {
        checkpoint.filter(|cp| cp.belongs_to(endpoint)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::EndpointWireFields;
    use proptest::prelude::*;
    use serde_json::json;

    fn adapter() -> CheckpointAdapter {
        CheckpointAdapter::new([
            CollectionSyncConfig::new("orders").with_batch_size(20),
            CollectionSyncConfig::new("visits"),
        ])
    }

    fn orders() -> CollectionId {
        CollectionId::new("orders")
    }

    #[test]
    fn pull_request_uses_target_cursor_field() {
        let adapter = adapter();
        let cp = Checkpoint::new(EndpointId::Secondary, "o-1", "17");

        let request = adapter
            .build_pull_request(&orders(), Some(&cp), 5, EndpointId::Secondary)
            .unwrap();

        let body = request.to_json();
        assert_eq!(body["checkpoint"]["server_updated_at"], "17");
        assert!(body["checkpoint"].get("updatedAt").is_none());
        assert_eq!(body["limit"], 5);
    }

    #[test]
    fn foreign_checkpoint_becomes_full_pull() {
        let adapter = adapter();
        let cp = Checkpoint::new(EndpointId::Primary, "o-1", "2024-05-01T00:00:00Z");

        let request = adapter
            .build_pull_request(&orders(), Some(&cp), 5, EndpointId::Secondary)
            .unwrap();

        assert!(request.is_full_pull());
        assert_eq!(request.to_json()["checkpoint"], Value::Null);
    }

    #[test]
    fn zero_limit_uses_batch_size() {
        let request = adapter()
            .build_pull_request(&orders(), None, 0, EndpointId::Primary)
            .unwrap();
        assert_eq!(request.limit, 20);
    }

    #[test]
    fn unknown_collection_is_rejected() {
        let err = adapter()
            .build_pull_request(&"nope".into(), None, 1, EndpointId::Primary)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCollection(name) if name == "nope"));
    }

    #[test]
    fn push_with_null_prior_is_tombstone() {
        let adapter = adapter();
        let doc = Document::new("o-1", json!({"total": 4}));
        let changes = vec![
            LocalChange::without_prior(doc.clone()),
            LocalChange::update(doc.clone(), doc.clone()),
        ];

        let request = adapter.build_push_request(&orders(), &changes).unwrap();
        assert!(request.rows[0].document.deleted);
        assert!(!request.rows[1].document.deleted);
        assert!(request.rows[1].assumed_prior.is_some());
    }

    #[test]
    fn normalizes_both_response_shapes() {
        let adapter = adapter();
        let primary = json!({
            "documents": [{"id": "o-1", "total": 1}],
            "checkpoint": {"id": "o-1", "updatedAt": "2024-05-01T00:00:00Z"}
        });
        let secondary = json!({
            "items": [{"id": "o-1", "total": 1}],
            "checkpoint": {"id": "o-1", "server_updated_at": 1714521600}
        });

        let a = adapter
            .normalize_response(&orders(), &primary, EndpointId::Primary)
            .unwrap();
        let b = adapter
            .normalize_response(&orders(), &secondary, EndpointId::Secondary)
            .unwrap();

        assert_eq!(a.documents, b.documents);
        assert_eq!(a.checkpoint.unwrap().cursor, Cursor::from("2024-05-01T00:00:00Z"));
        let cp = b.checkpoint.unwrap();
        assert_eq!(cp.cursor, Cursor::from(1714521600u64));
        assert_eq!(cp.endpoint, EndpointId::Secondary);
    }

    #[test]
    fn peer_shaped_response_is_a_mismatch() {
        let adapter = adapter();
        let secondary_shaped = json!({"items": [], "checkpoint": null});

        let err = adapter
            .normalize_response(&orders(), &secondary_shaped, EndpointId::Primary)
            .unwrap_err();
        assert!(err.is_mismatch());
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn peer_cursor_field_is_a_mismatch() {
        let raw = json!({
            "documents": [{"id": "o-1"}],
            "checkpoint": {"id": "o-1", "server_updated_at": "5"}
        });
        let err = adapter()
            .normalize_response(&orders(), &raw, EndpointId::Primary)
            .unwrap_err();
        assert!(err.is_mismatch());
    }

    #[test]
    fn malformed_responses_are_mismatches() {
        let adapter = adapter();
        let cases = [
            json!([]),
            json!({"documents": {}}),
            json!({"documents": [{"total": 1}], "checkpoint": {"updatedAt": "1"}}),
            json!({"documents": [{"id": "a"}]}),
            json!({"documents": [], "checkpoint": "x"}),
            json!({"documents": [], "checkpoint": {"updatedAt": {"nested": true}}}),
        ];

        for raw in cases {
            let result = adapter.normalize_response(&orders(), &raw, EndpointId::Primary);
            assert!(
                matches!(result, Err(ProtocolError::ProtocolMismatch { .. })),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn empty_page_without_checkpoint_keeps_cursor() {
        let raw = json!({"documents": [], "checkpoint": null});
        let envelope = adapter()
            .normalize_response(&orders(), &raw, EndpointId::Primary)
            .unwrap();
        assert!(envelope.is_empty());
        assert!(envelope.checkpoint.is_none());
    }

    #[test]
    fn missing_checkpoint_id_falls_back_to_last_document() {
        let raw = json!({
            "documents": [{"id": "a"}, {"id": "b"}],
            "checkpoint": {"updatedAt": "9"}
        });
        let envelope = adapter()
            .normalize_response(&orders(), &raw, EndpointId::Primary)
            .unwrap();
        assert_eq!(envelope.checkpoint.unwrap().id, "b");
    }

    #[test]
    fn shared_field_names_do_not_trip_peer_detection() {
        let shared = EndpointWireFields::new("seq", "docs");
        let adapter = CheckpointAdapter::for_collection(
            CollectionSyncConfig::new("orders")
                .with_fields(EndpointId::Primary, shared.clone())
                .with_fields(EndpointId::Secondary, shared),
        );
        let raw = json!({"docs": [], "checkpoint": {"id": "", "seq": 3}});
        let envelope = adapter
            .normalize_response(&orders(), &raw, EndpointId::Secondary)
            .unwrap();
        assert_eq!(envelope.checkpoint.unwrap().cursor, Cursor::from(3u64));
    }

    #[test]
    fn numeric_cursor_is_sent_back_as_a_number() {
        let adapter = adapter();
        let raw = json!({
            "items": [{"id": "o-1"}],
            "checkpoint": {"id": "o-1", "server_updated_at": 1714521600}
        });
        let cp = adapter
            .normalize_response(&orders(), &raw, EndpointId::Secondary)
            .unwrap()
            .checkpoint
            .unwrap();

        let request = adapter
            .build_pull_request(&orders(), Some(&cp), 5, EndpointId::Secondary)
            .unwrap();
        assert_eq!(
            request.to_json()["checkpoint"]["server_updated_at"],
            json!(1714521600)
        );
    }

    fn any_cursor() -> impl Strategy<Value = Cursor> {
        prop_oneof![
            "[0-9A-Za-z:.-]{1,32}".prop_map(Cursor::from),
            any::<u64>().prop_map(Cursor::from),
            any::<i64>().prop_map(Cursor::from),
        ]
    }

    proptest! {
        #[test]
        fn checkpoint_round_trips_on_its_own_endpoint(
            id in "[a-z0-9-]{1,16}",
            cursor in any_cursor(),
            use_secondary in any::<bool>(),
        ) {
            let adapter = adapter();
            let endpoint = if use_secondary { EndpointId::Secondary } else { EndpointId::Primary };
            let fields = adapter.config(&orders()).unwrap().fields(endpoint).clone();
            let cp = Checkpoint::new(endpoint, id.clone(), cursor.clone());

            // The endpoint echoes the checkpoint it was sent.
            let request = adapter.build_pull_request(&orders(), Some(&cp), 10, endpoint).unwrap();
            let mut raw = serde_json::Map::new();
            raw.insert(fields.documents_key.clone(), json!([{"id": id}]));
            raw.insert("checkpoint".into(), request.to_json()["checkpoint"].clone());

            let envelope = adapter
                .normalize_response(&orders(), &Value::Object(raw), endpoint)
                .unwrap();
            let next = envelope.checkpoint.unwrap();
            prop_assert_eq!(&next, &cp);

            let again = adapter.build_pull_request(&orders(), Some(&next), 10, endpoint).unwrap();
            prop_assert_eq!(again.to_json(), request.to_json());

            let foreign = adapter
                .build_pull_request(&orders(), Some(&next), 10, endpoint.other())
                .unwrap();
            prop_assert!(foreign.is_full_pull());
        }
    }
}
