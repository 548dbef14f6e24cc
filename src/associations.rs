//! Cross-object association resolution via the v3 batch-read API.
//!
//! Association edges are an enrichment stream: they ride alongside the
//! object rows but are not transactional with them. A failed batch fails the
//! page's association fetch as a whole; the orchestrator decides whether
//! that aborts the run (`fail_fast`) or is reported and skipped.

use serde_json::{json, Value};

use crate::client::ApiClient;
use crate::error::{ExtractError, Result};

/// Maximum ids per batch-read call, imposed by the API.
pub const BATCH_LIMIT: usize = 100;

/// Column order of association output tables.
pub const ASSOCIATION_COLUMNS: [&str; 4] =
    ["from_object_type", "from_id", "to_object_type", "to_id"];

/// One directed relationship edge between two objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEdge {
    pub from_object_type: String,
    pub from_id: String,
    pub to_object_type: String,
    pub to_id: String,
}

pub fn association_table_name(from_object_type: &str, to_object_type: &str) -> String {
    format!("{}_{}_association", from_object_type, to_object_type)
}

/// Fetch all edges from `ids` (of `from_object_type`) to `to_object_type`.
///
/// The id list is chunked to [`BATCH_LIMIT`] and fetched with one batch-read
/// call per chunk; results are concatenated in input order. Any failing
/// chunk fails the whole fetch with [`ExtractError::AssociationFetch`].
pub async fn resolve_associations(
    client: &ApiClient,
    from_object_type: &str,
    to_object_type: &str,
    ids: &[String],
) -> Result<Vec<AssociationEdge>> {
    let path = format!(
        "crm/v3/associations/{}/{}/batch/read",
        from_object_type, to_object_type
    );
    let wrap = |err: ExtractError| ExtractError::AssociationFetch {
        from_object_type: from_object_type.to_string(),
        to_object_type: to_object_type.to_string(),
        source: Box::new(err),
    };

    let mut edges = Vec::new();
    for chunk in ids.chunks(BATCH_LIMIT) {
        let inputs: Vec<Value> = chunk.iter().map(|id| json!({ "id": id })).collect();
        let body = client
            .post_json(&path, &json!({ "inputs": inputs }))
            .await
            .map_err(wrap)?;

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                wrap(ExtractError::InvalidResponse {
                    endpoint: path.clone(),
                    message: "missing results array".to_string(),
                })
            })?;

        for result in results {
            let Some(from_id) = result.get("from").and_then(|f| f.get("id")).and_then(id_string)
            else {
                tracing::warn!(path = %path, "association result without a from id, skipping");
                continue;
            };
            let targets = result.get("to").and_then(Value::as_array);
            for target in targets.into_iter().flatten() {
                if let Some(to_id) = target.get("id").and_then(id_string) {
                    edges.push(AssociationEdge {
                        from_object_type: from_object_type.to_string(),
                        from_id: from_id.clone(),
                        to_object_type: to_object_type.to_string(),
                        to_id,
                    });
                }
            }
        }
    }

    Ok(edges)
}

// Ids are strings in v3 responses, but legacy payloads carry numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Method, RetryPolicy, Transport, TransportResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Echoes each batch back as one self-association per input id and
    /// counts the calls.
    struct EchoBatchTransport {
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Transport for EchoBatchTransport {
        async fn request(
            &self,
            _method: Method,
            _path: &str,
            _query: &[(String, String)],
            body: Option<&Value>,
        ) -> crate::error::Result<TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let inputs = body
                .and_then(|b| b.get("inputs"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            self.batch_sizes.lock().unwrap().push(inputs.len());

            let results: Vec<Value> = inputs
                .iter()
                .map(|input| {
                    let id = input.get("id").and_then(Value::as_str).unwrap().to_string();
                    json!({"from": {"id": id.clone()}, "to": [{"id": format!("c-{}", id)}]})
                })
                .collect();
            Ok(TransportResponse {
                status: 200,
                headers: HashMap::new(),
                body: json!({ "results": results }).to_string(),
            })
        }
    }

    #[tokio::test]
    async fn large_id_lists_are_chunked_without_loss() {
        let transport = Arc::new(EchoBatchTransport {
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        });
        let client = ApiClient::new(transport.clone(), RetryPolicy::with_max_retries(0));

        let ids: Vec<String> = (0..2500).map(|i| i.to_string()).collect();
        let edges = resolve_associations(&client, "contact", "company", &ids)
            .await
            .unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 25);
        assert!(transport
            .batch_sizes
            .lock()
            .unwrap()
            .iter()
            .all(|&size| size == 100));
        assert_eq!(edges.len(), 2500);
        // No duplication, order preserved.
        assert_eq!(edges[0].from_id, "0");
        assert_eq!(edges[0].to_id, "c-0");
        assert_eq!(edges[2499].from_id, "2499");
    }

    #[tokio::test]
    async fn multiple_targets_expand_to_one_edge_each() {
        struct FanOutTransport;

        #[async_trait]
        impl Transport for FanOutTransport {
            async fn request(
                &self,
                _method: Method,
                _path: &str,
                _query: &[(String, String)],
                _body: Option<&Value>,
            ) -> crate::error::Result<TransportResponse> {
                Ok(TransportResponse {
                    status: 200,
                    headers: HashMap::new(),
                    body: json!({
                        "results": [
                            {"from": {"id": "1"}, "to": [{"id": "10"}, {"id": "11"}]},
                            {"from": {"id": "2"}, "to": []}
                        ]
                    })
                    .to_string(),
                })
            }
        }

        let client = ApiClient::new(Arc::new(FanOutTransport), RetryPolicy::with_max_retries(0));
        let edges = resolve_associations(&client, "contact", "company", &["1".into(), "2".into()])
            .await
            .unwrap();

        assert_eq!(
            edges,
            vec![
                AssociationEdge {
                    from_object_type: "contact".into(),
                    from_id: "1".into(),
                    to_object_type: "company".into(),
                    to_id: "10".into(),
                },
                AssociationEdge {
                    from_object_type: "contact".into(),
                    from_id: "1".into(),
                    to_object_type: "company".into(),
                    to_id: "11".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_batch_fails_the_whole_fetch() {
        struct BrokenTransport;

        #[async_trait]
        impl Transport for BrokenTransport {
            async fn request(
                &self,
                _method: Method,
                _path: &str,
                _query: &[(String, String)],
                _body: Option<&Value>,
            ) -> crate::error::Result<TransportResponse> {
                Ok(TransportResponse {
                    status: 400,
                    headers: HashMap::new(),
                    body: "{\"message\": \"unknown object type\"}".to_string(),
                })
            }
        }

        let client = ApiClient::new(Arc::new(BrokenTransport), RetryPolicy::with_max_retries(0));
        let err = resolve_associations(&client, "contact", "widget", &["1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::AssociationFetch { .. }));
        assert!(err.is_user_error());
    }

    #[test]
    fn table_name_format() {
        assert_eq!(
            association_table_name("contact", "company"),
            "contact_company_association"
        );
    }
}
