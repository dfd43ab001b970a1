use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

#[derive(Clone)]
pub struct OsegMetrics {
    pub lookups: Counter,
    pub resident_hits: Counter,
    pub cache_hits: Counter,
    pub store_lookups: Counter,
    pub coalesced_lookups: Counter,
    pub not_found_retries: Counter,
    pub migrations_started: Counter,
    pub acks_routed: Counter,
}

impl OsegMetrics {
    fn init() -> Self {
        Self {
            lookups: Counter::default(),
            resident_hits: Counter::default(),
            cache_hits: Counter::default(),
            store_lookups: Counter::default(),
            coalesced_lookups: Counter::default(),
            not_found_retries: Counter::default(),
            migrations_started: Counter::default(),
            acks_routed: Counter::default(),
        }
    }

    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::init();

        registry.register(
            "oseg_lookups",
            "Total lookup requests",
            metrics.lookups.clone(),
        );
        registry.register(
            "oseg_resident_hits",
            "Lookups answered from the local resident set",
            metrics.resident_hits.clone(),
        );
        registry.register(
            "oseg_cache_hits",
            "Lookups answered from the lookup cache",
            metrics.cache_hits.clone(),
        );
        registry.register(
            "oseg_store_lookups",
            "GETs actually issued to the backing store",
            metrics.store_lookups.clone(),
        );
        registry.register(
            "oseg_coalesced_lookups",
            "Lookups absorbed by an in-flight resolution",
            metrics.coalesced_lookups.clone(),
        );
        registry.register(
            "oseg_not_found_retries",
            "Retries issued after the not-found sit-out",
            metrics.not_found_retries.clone(),
        );
        registry.register(
            "oseg_migrations_started",
            "Outbound migrations started",
            metrics.migrations_started.clone(),
        );
        registry.register(
            "oseg_acks_routed",
            "Migration acknowledgments accepted by the transport",
            metrics.acks_routed.clone(),
        );

        metrics
    }
}

pub static OSEG_METRICS: OnceCell<OsegMetrics> = OnceCell::const_new();
