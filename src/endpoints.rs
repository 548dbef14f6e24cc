//! Catalog of HubSpot object-type endpoint definitions.
//!
//! Every object type the engine can extract is described by an
//! [`EndpointDefinition`]: where it lives, how its pages are walked, and
//! which capabilities it supports. The orchestrator consults these flags
//! instead of branching on object-type names, so adding an endpoint is a
//! registration, not a code change in the engine.
//!
//! Two pagination protocols coexist in the HubSpot API:
//!
//! - **CRM v3** — envelope `{results: [...], paging: {next: {after}}}` with
//!   an opaque cursor, and a `POST {path}/search` variant for incremental
//!   (modified-since) fetches.
//! - **Legacy v1** — envelope `{<results key>: [...], <has-more key>, offset}`.
//!   The key names are not consistent across v1 endpoints: campaigns use
//!   `hasMore`/`limit`, contact lists use `has-more`/`count`.
//!
//! Custom object types are account-specific, so they cannot appear in the
//! static catalog; [`EndpointRegistry::register_custom_object`] adds them at
//! runtime from configuration.

use std::collections::BTreeMap;

use crate::error::{ExtractError, Result};

/// Maximum page size for CRM v3 listing requests.
pub const PAGE_MAX_SIZE: u32 = 100;
/// Reduced page size when property history is requested alongside values.
pub const PAGE_WITH_HISTORY_MAX_SIZE: u32 = 50;
/// Default page size for legacy v1 endpoints.
pub const DEFAULT_V1_LIMIT: u32 = 1000;

/// How an endpoint's response envelope is paged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingStyle {
    /// CRM v3 cursor paging: `results` + `paging.next.after`.
    Cursor,
    /// Legacy offset paging with endpoint-specific envelope keys.
    Offset {
        results_key: &'static str,
        has_more_key: &'static str,
        limit_key: &'static str,
        limit: u32,
    },
}

impl PagingStyle {
    fn v1(results_key: &'static str) -> Self {
        Self::Offset {
            results_key,
            has_more_key: "hasMore",
            limit_key: "limit",
            limit: DEFAULT_V1_LIMIT,
        }
    }
}

/// Immutable descriptor for one extractable object type.
#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    pub object_type: String,
    /// API resource path relative to the base URL, without leading slash.
    pub path: String,
    pub primary_key: &'static str,
    pub paging: PagingStyle,
    /// Whether the endpoint accepts a `properties` selection.
    pub supports_properties: bool,
    /// Whether the v3 associations batch-read API covers this type.
    pub supports_associations: bool,
    /// Whether archived records can be listed (`archived=true`).
    pub supports_archived: bool,
    /// Whether a modified-since bound can be applied (v3 search or a
    /// legacy query parameter). Determines incremental-fetch eligibility.
    pub supports_incremental: bool,
    /// Property name used in v3 search GTE filters.
    pub since_property: Option<&'static str>,
    /// Query parameter used for modified-since bounds on legacy endpoints.
    pub since_query_param: Option<&'static str>,
}

impl EndpointDefinition {
    /// A standard CRM v3 object endpoint (contacts, deals, tickets, ...).
    fn crm_object(
        object_type: &str,
        path_segment: &str,
        since_property: &'static str,
        supports_archived: bool,
    ) -> Self {
        Self {
            object_type: object_type.to_string(),
            path: format!("crm/v3/objects/{}", path_segment),
            primary_key: "id",
            paging: PagingStyle::Cursor,
            supports_properties: true,
            supports_associations: true,
            supports_archived,
            supports_incremental: true,
            since_property: Some(since_property),
            since_query_param: None,
        }
    }
}

/// Lookup table of endpoint definitions, keyed by object type name.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, EndpointDefinition>,
}

impl EndpointRegistry {
    /// The static catalog of built-in object types.
    pub fn builtin() -> Self {
        let mut registry = Self::default();

        registry.register(EndpointDefinition::crm_object(
            "contact",
            "contacts",
            "lastmodifieddate",
            true,
        ));
        registry.register(EndpointDefinition::crm_object(
            "company",
            "companies",
            "hs_lastmodifieddate",
            true,
        ));
        registry.register(EndpointDefinition::crm_object(
            "deal",
            "deals",
            "hs_lastmodifieddate",
            true,
        ));
        registry.register(EndpointDefinition::crm_object(
            "line_item",
            "line_items",
            "hs_lastmodifieddate",
            true,
        ));
        registry.register(EndpointDefinition::crm_object(
            "product",
            "products",
            "hs_lastmodifieddate",
            true,
        ));
        registry.register(EndpointDefinition::crm_object(
            "ticket",
            "tickets",
            "hs_lastmodifieddate",
            true,
        ));
        // Archived listing is not available for quotes and engagements.
        registry.register(EndpointDefinition::crm_object(
            "quote",
            "quotes",
            "hs_lastmodifieddate",
            false,
        ));
        for engagement in ["note", "call", "task", "meeting", "email"] {
            registry.register(EndpointDefinition::crm_object(
                engagement,
                &format!("{}s", engagement),
                "hs_lastmodifieddate",
                false,
            ));
        }

        registry.register(EndpointDefinition {
            object_type: "owner".to_string(),
            path: "crm/v3/owners".to_string(),
            primary_key: "id",
            paging: PagingStyle::Cursor,
            supports_properties: false,
            supports_associations: false,
            supports_archived: false,
            supports_incremental: false,
            since_property: None,
            since_query_param: None,
        });

        registry.register(EndpointDefinition {
            object_type: "form".to_string(),
            path: "marketing/v3/forms".to_string(),
            primary_key: "id",
            paging: PagingStyle::Cursor,
            supports_properties: false,
            supports_associations: false,
            supports_archived: false,
            supports_incremental: false,
            since_property: None,
            since_query_param: None,
        });

        registry.register(EndpointDefinition {
            object_type: "campaign".to_string(),
            path: "email/public/v1/campaigns/by-id".to_string(),
            primary_key: "id",
            paging: PagingStyle::v1("campaigns"),
            supports_properties: false,
            supports_associations: false,
            supports_archived: false,
            supports_incremental: false,
            since_property: None,
            since_query_param: None,
        });

        registry.register(EndpointDefinition {
            object_type: "contact_list".to_string(),
            path: "contacts/v1/lists".to_string(),
            primary_key: "listId",
            paging: PagingStyle::Offset {
                results_key: "lists",
                has_more_key: "has-more",
                limit_key: "count",
                limit: 250,
            },
            supports_properties: false,
            supports_associations: false,
            supports_archived: false,
            supports_incremental: false,
            since_property: None,
            since_query_param: None,
        });

        registry.register(EndpointDefinition {
            object_type: "email_statistic".to_string(),
            path: "marketing-emails/v1/emails/with-statistics".to_string(),
            primary_key: "id",
            paging: PagingStyle::v1("objects"),
            supports_properties: false,
            supports_associations: false,
            supports_archived: false,
            supports_incremental: true,
            since_property: None,
            since_query_param: Some("updated__gte"),
        });

        registry
    }

    /// Register (or replace) an endpoint definition.
    pub fn register(&mut self, def: EndpointDefinition) {
        self.endpoints.insert(def.object_type.clone(), def);
    }

    /// Register an account-specific custom object type by its HubSpot type
    /// id (e.g. `"2-12345678"`). Custom objects get the full CRM v3 surface.
    pub fn register_custom_object(&mut self, type_id: &str) {
        self.register(EndpointDefinition::crm_object(
            type_id,
            type_id,
            "hs_lastmodifieddate",
            true,
        ));
    }

    pub fn lookup(&self, object_type: &str) -> Result<&EndpointDefinition> {
        self.endpoints
            .get(object_type)
            .ok_or_else(|| ExtractError::UnknownObjectType(object_type.to_string()))
    }

    /// All registered object type names, in sorted order.
    pub fn object_types(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}
