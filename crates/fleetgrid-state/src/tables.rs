//! redb table definitions for the Fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{deployment_id}:{service_name}`.

use redb::TableDefinition;

/// Every table in the store shares this shape.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Managed servers keyed by `{server_id}`.
pub const SERVERS: JsonTable = TableDefinition::new("servers");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Deployment secrets keyed by `{deployment_id}`.
pub const SECRETS: JsonTable = TableDefinition::new("secrets");

/// Service registrations keyed by `{deployment_id}:{service_name}`.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Web UI routes keyed by `{deployment_id}`.
pub const PROXY_ROUTES: JsonTable = TableDefinition::new("proxy_routes");

/// Service routes keyed by `{deployment_id}:{service_name}`.
pub const SERVICE_ROUTES: JsonTable = TableDefinition::new("service_routes");

/// Command log keyed by `{command_id}`.
pub const COMMANDS: JsonTable = TableDefinition::new("commands");

pub const ALL_TABLES: [JsonTable; 7] = [
    SERVERS,
    DEPLOYMENTS,
    SECRETS,
    SERVICES,
    PROXY_ROUTES,
    SERVICE_ROUTES,
    COMMANDS,
];
