use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_gauge, Encoder, GaugeVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref CLIENT_BANDWIDTH: GaugeVec = register_gauge_vec!(
        "mediarelay_client_bandwidth_bytes",
        "Current bandwidth delivered per stream in bytes/sec",
        &["stream_id"]
    )
    .unwrap();
    pub static ref FFMPEG_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "mediarelay_ffmpeg_cpu_usage_percent",
        "Current CPU usage of the ffmpeg process per stream (0-100+)",
        &["stream_id"]
    )
    .unwrap();
    pub static ref ACTIVE_TRANSCODES: IntGauge = register_int_gauge!(
        "mediarelay_active_transcodes",
        "Number of live transcoder processes"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
