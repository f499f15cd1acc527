mod store;

pub use store::{
    Finding, KeyFilter, RateLimitedFinding, ScanProgress, Store, StoreStats, QUEUE_BALANCER,
    QUEUE_GPT_LOAD,
};
