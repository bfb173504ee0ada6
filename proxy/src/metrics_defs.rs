use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Badge request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const TOKEN_CACHE_HIT: MetricDef = MetricDef {
    name: "token_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups answered by a cached badge token",
};

pub const TOKEN_CACHE_MISS: MetricDef = MetricDef {
    name: "token_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that started an upstream token fetch",
};

pub const TOKEN_CACHE_COALESCED: MetricDef = MetricDef {
    name: "token_cache.coalesced",
    metric_type: MetricType::Counter,
    description: "Number of lookups that waited on a token fetch already in flight",
};

pub const TOKEN_FETCH_DURATION: MetricDef = MetricDef {
    name: "upstream.token_fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch a badge token from the upstream in seconds",
};

pub const TOKEN_FETCH_MALFORMED: MetricDef = MetricDef {
    name: "upstream.token_fetch.malformed",
    metric_type: MetricType::Counter,
    description: "Number of token responses that could not be parsed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    TOKEN_CACHE_HIT,
    TOKEN_CACHE_MISS,
    TOKEN_CACHE_COALESCED,
    TOKEN_FETCH_DURATION,
    TOKEN_FETCH_MALFORMED,
];
