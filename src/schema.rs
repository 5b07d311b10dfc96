//! Detection of the on-store directory layout.

use crate::service;
use crate::store::Store;

use tracing::{event, instrument, Level};

/// Directory segment of the flat, legacy layout.
pub const V1_SEGMENT: &str = "dist";

/// Directory segment of the nested, current layout.
pub const V2_SEGMENT: &str = "dist2";

/// Which directory layout a service registers with.
///
/// - `V1`: `{prefix}/dist/{location}/{copy id}` holds the processor map.
/// - `V2`: `{prefix}/dist2/{location}/{copy id}/reg` holds a registration
///   document, which nests the processor map under `"servs"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub const fn segment(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => V1_SEGMENT,
            SchemaVersion::V2 => V2_SEGMENT,
        }
    }

    /// The directory a service registers under, for this layout.
    pub fn path(&self, prefix: &str, location: &service::Location) -> String {
        format!("{prefix}/{}/{location}", self.segment())
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaVersion::V1 => "v1".fmt(f),
            SchemaVersion::V2 => "v2".fmt(f),
        }
    }
}

/// Decides which layout a service location uses.
///
/// The current layout is preferred. If neither directory can be read, the
/// current layout is assumed: the service may simply not have registered
/// yet, and the resolver will pick it up once it does.
#[instrument(skip(store), name = "schema::probe")]
pub async fn probe(store: &dyn Store, prefix: &str, location: &service::Location) -> SchemaVersion {
    let v2 = SchemaVersion::V2.path(prefix, location);
    let v2_err = match store.get(&v2, false).await {
        Ok(_) => {
            event!(Level::INFO, path = %v2, "Using nested (v2) layout");
            return SchemaVersion::V2;
        }
        Err(err) => err,
    };
    event!(Level::DEBUG, path = %v2, err = ?v2_err, "Nested (v2) layout unavailable");

    let v1 = SchemaVersion::V1.path(prefix, location);
    match store.get(&v1, false).await {
        Ok(_) => {
            event!(Level::INFO, path = %v1, "Using flat (v1) layout");
            SchemaVersion::V1
        }
        Err(err) => {
            event!(
                Level::WARN,
                v2_path = %v2,
                v2_err = ?v2_err,
                v1_path = %v1,
                v1_err = ?err,
                "No registrations found in either layout; waiting on v2"
            );
            SchemaVersion::V2
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::test_utils::{register_v1, register_v2, setup_tracing_subscriber};

    #[test]
    fn paths() {
        let location = service::Location::new("base/account");
        assert_eq!(
            SchemaVersion::V2.path("/roc", &location),
            "/roc/dist2/base/account"
        );
        assert_eq!(
            SchemaVersion::V1.path("/roc", &location),
            "/roc/dist/base/account"
        );
    }

    #[tokio::test]
    async fn probe_prefers_v2() {
        setup_tracing_subscriber();
        let store = MemoryStore::new();
        register_v1(&store, "/roc/dist/svc", 0, &[("p", "a:1")]);
        register_v2(&store, "/roc/dist2/svc", 0, &[("p", "a:1")]);
        let version = probe(&store, "/roc", &"svc".into()).await;
        assert_eq!(version, SchemaVersion::V2);
    }

    #[tokio::test]
    async fn probe_falls_back_to_v1() {
        setup_tracing_subscriber();
        let store = MemoryStore::new();
        register_v1(&store, "/roc/dist/svc", 0, &[("p", "a:1")]);
        let version = probe(&store, "/roc", &"svc".into()).await;
        assert_eq!(version, SchemaVersion::V1);
    }

    #[tokio::test]
    async fn probe_defaults_to_v2() {
        setup_tracing_subscriber();
        let store = MemoryStore::new();
        let version = probe(&store, "/roc", &"svc".into()).await;
        assert_eq!(version, SchemaVersion::V2);

        // Unreachable stores also default to v2, rather than failing.
        store.set_online(false);
        let version = probe(&store, "/roc", &"svc".into()).await;
        assert_eq!(version, SchemaVersion::V2);
    }

    #[tokio::test]
    async fn probe_accepts_empty_directories() {
        setup_tracing_subscriber();
        let store = MemoryStore::new();
        store.mkdir("/roc/dist/svc").unwrap();
        let version = probe(&store, "/roc", &"svc".into()).await;
        assert_eq!(version, SchemaVersion::V1);
    }
}
