//! Property resolution: turning the configured fetch-mode selection into the
//! concrete, ordered column list for one object type.
//!
//! The resolved [`PropertySet`] carries both the request's property
//! selection and the output table's schema (the selection plus the primary
//! key and fixed metadata columns). It is computed once per object type per
//! run and never mutated afterwards.

use serde_json::Value;

use crate::client::ApiClient;
use crate::config::{PropertiesConfig, PropertyMode};
use crate::endpoints::EndpointDefinition;
use crate::error::{ExtractError, Result};

/// Metadata columns present on every extracted object, before any
/// properties. The primary key is prepended separately in case an endpoint
/// names it differently.
pub const METADATA_COLUMNS: [&str; 4] = ["created_at", "updated_at", "archived", "archived_at"];

/// Hardcoded minimal property sets used by `mode = "base"`. Object types
/// without an entry (custom objects, mainly) get metadata columns only.
fn base_properties(object_type: &str) -> &'static [&'static str] {
    match object_type {
        "contact" => &["firstname", "lastname", "email"],
        "company" => &["name", "domain"],
        "deal" => &["dealname", "amount", "dealstage", "pipeline", "closedate"],
        "line_item" => &["name", "quantity", "price"],
        "product" => &["name", "price"],
        "ticket" => &["subject", "content", "hs_pipeline_stage"],
        "quote" => &["hs_title", "hs_expiration_date"],
        "note" => &["hs_note_body"],
        "call" => &["hs_call_title", "hs_call_body"],
        "task" => &["hs_task_subject", "hs_task_body"],
        "meeting" => &["hs_meeting_title"],
        "email" => &["hs_email_subject"],
        _ => &[],
    }
}

/// The resolved column list for one object type.
#[derive(Debug, Clone)]
pub struct PropertySet {
    pub object_type: String,
    /// Ordered, deduplicated columns: primary key, metadata, then
    /// properties. This is the output table schema.
    pub columns: Vec<String>,
    /// Property names to request from the API. Excludes the primary key and
    /// metadata columns, which come from the record envelope, not the
    /// properties sub-map.
    pub properties: Vec<String>,
    /// Property names to fetch value history for; empty unless configured.
    pub with_history: Vec<String>,
}

/// Resolve the property set for `def` according to the configured mode.
///
/// - `all` queries the property-schema endpoint and takes every returned
///   name; a failing schema call surfaces as [`ExtractError::SchemaFetch`]
///   rather than silently degrading to the base set.
/// - `base` uses the hardcoded minimal set.
/// - `custom` takes the configured explicit list verbatim (deduplicated).
///   Names are checked against the schema when it can be fetched; unknown
///   names are only warned about — HubSpot tolerates requesting nonexistent
///   properties and returns them empty.
pub async fn resolve_properties(
    client: &ApiClient,
    def: &EndpointDefinition,
    config: &PropertiesConfig,
) -> Result<PropertySet> {
    let mut properties = Vec::new();
    if def.supports_properties {
        match config.mode {
            PropertyMode::All => {
                let schema = fetch_property_schema(client, &def.object_type).await?;
                for name in &schema {
                    push_unique(&mut properties, name);
                }
            }
            PropertyMode::Base => {
                for name in base_properties(&def.object_type) {
                    push_unique(&mut properties, name);
                }
            }
            PropertyMode::Custom => {
                let explicit = config
                    .custom_lists
                    .get(&def.object_type)
                    .cloned()
                    .unwrap_or_default();
                match fetch_property_schema(client, &def.object_type).await {
                    Ok(schema) => {
                        for name in &explicit {
                            if !schema.iter().any(|known| known == name) {
                                tracing::warn!(
                                    object_type = %def.object_type,
                                    property = %name,
                                    "property not present in the schema, it will come back empty"
                                );
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            object_type = %def.object_type,
                            "could not fetch the property schema for validation: {}",
                            err
                        );
                    }
                }
                for name in &explicit {
                    push_unique(&mut properties, name);
                }
            }
        }
    }

    let mut columns = Vec::new();
    push_unique(&mut columns, def.primary_key);
    for column in METADATA_COLUMNS {
        push_unique(&mut columns, column);
    }
    for name in &properties {
        push_unique(&mut columns, name);
    }

    let mut with_history = Vec::new();
    if config.fetch_property_history && def.supports_properties {
        if let Some(names) = config.history_lists.get(&def.object_type) {
            for name in names {
                push_unique(&mut with_history, name);
            }
        }
    }

    Ok(PropertySet {
        object_type: def.object_type.clone(),
        columns,
        properties,
        with_history,
    })
}

/// GET the property schema and return every property name, in API order.
pub async fn fetch_property_schema(
    client: &ApiClient,
    object_type: &str,
) -> Result<Vec<String>> {
    let path = format!("crm/v3/properties/{}", object_type);
    let body = client.get_json(&path, &[]).await.map_err(|err| {
        ExtractError::SchemaFetch {
            object_type: object_type.to_string(),
            source: Box::new(err),
        }
    })?;

    let results = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractError::SchemaFetch {
            object_type: object_type.to_string(),
            source: Box::new(ExtractError::InvalidResponse {
                endpoint: path.clone(),
                message: "missing results array".to_string(),
            }),
        })?;

    Ok(results
        .iter()
        .filter_map(|prop| prop.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

fn push_unique(columns: &mut Vec<String>, name: &str) {
    if !columns.iter().any(|existing| existing == name) {
        columns.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Method, RetryPolicy, Transport, TransportResponse};
    use crate::endpoints::EndpointRegistry;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Serves a canned property schema; everything else 404s.
    struct SchemaTransport {
        names: Vec<&'static str>,
    }

    #[async_trait]
    impl Transport for SchemaTransport {
        async fn request(
            &self,
            _method: Method,
            path: &str,
            _query: &[(String, String)],
            _body: Option<&Value>,
        ) -> crate::error::Result<TransportResponse> {
            let (status, body) = if path.starts_with("crm/v3/properties/") {
                let results: Vec<Value> =
                    self.names.iter().map(|n| json!({"name": n})).collect();
                (200, json!({"results": results}).to_string())
            } else {
                (404, "{}".to_string())
            };
            Ok(TransportResponse {
                status,
                headers: HashMap::new(),
                body,
            })
        }
    }

    fn client(names: Vec<&'static str>) -> ApiClient {
        ApiClient::new(
            Arc::new(SchemaTransport { names }),
            RetryPolicy::with_max_retries(0),
        )
    }

    fn config(mode: PropertyMode) -> PropertiesConfig {
        PropertiesConfig {
            mode,
            ..PropertiesConfig::default()
        }
    }

    #[tokio::test]
    async fn base_mode_uses_hardcoded_set() {
        let registry = EndpointRegistry::builtin();
        let def = registry.lookup("contact").unwrap();
        let set = resolve_properties(&client(vec![]), def, &config(PropertyMode::Base))
            .await
            .unwrap();
        assert_eq!(
            set.columns,
            vec![
                "id",
                "created_at",
                "updated_at",
                "archived",
                "archived_at",
                "firstname",
                "lastname",
                "email"
            ]
        );
        assert_eq!(set.properties, vec!["firstname", "lastname", "email"]);
        assert!(set.with_history.is_empty());
    }

    #[tokio::test]
    async fn all_mode_takes_every_schema_property() {
        let registry = EndpointRegistry::builtin();
        let def = registry.lookup("company").unwrap();
        let set = resolve_properties(
            &client(vec!["name", "domain", "hs_lead_status"]),
            def,
            &config(PropertyMode::All),
        )
        .await
        .unwrap();
        assert!(set.columns.contains(&"hs_lead_status".to_string()));
        assert_eq!(set.columns[0], "id");
    }

    #[tokio::test]
    async fn custom_mode_returns_explicit_list_verbatim() {
        let registry = EndpointRegistry::builtin();
        let def = registry.lookup("contact").unwrap();

        let mut props = config(PropertyMode::Custom);
        props
            .custom_lists
            .insert("contact".to_string(), vec!["foo".into(), "bar".into(), "foo".into()]);

        // "foo" and "bar" are not in the schema, they still pass through.
        let set = resolve_properties(&client(vec!["email"]), def, &props)
            .await
            .unwrap();
        assert_eq!(
            set.columns,
            vec![
                "id",
                "created_at",
                "updated_at",
                "archived",
                "archived_at",
                "foo",
                "bar"
            ]
        );
        // The request selection carries the explicit names only, never the
        // primary key or metadata columns.
        assert_eq!(set.properties, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn history_list_resolves_separately() {
        let registry = EndpointRegistry::builtin();
        let def = registry.lookup("contact").unwrap();

        let mut props = config(PropertyMode::Base);
        props.fetch_property_history = true;
        props
            .history_lists
            .insert("contact".to_string(), vec!["lifecyclestage".into()]);

        let set = resolve_properties(&client(vec![]), def, &props).await.unwrap();
        assert_eq!(set.with_history, vec!["lifecyclestage"]);
    }

    #[tokio::test]
    async fn endpoints_without_properties_get_metadata_only() {
        let registry = EndpointRegistry::builtin();
        let def = registry.lookup("owner").unwrap();
        let set = resolve_properties(&client(vec![]), def, &config(PropertyMode::All))
            .await
            .unwrap();
        assert_eq!(
            set.columns,
            vec!["id", "created_at", "updated_at", "archived", "archived_at"]
        );
        assert!(set.properties.is_empty());
    }
}
