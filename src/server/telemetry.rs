//! dev stats snapshots sent to every client over signaling
//!
//! The browser dev page graphs these to compare the immediate lane against
//! the buffered performance lane.  One frame per second; the lane counters
//! are windowed by the 5 second operator summary which resets them.
use serde::Serialize;
use serde_json::{json, Value};

use crate::server::client::ClientRegistry;

/// how many window samples ride along in each snapshot
pub const HISTORY_LEN: usize = 50;

/// events played per lane since the last counter reset
#[derive(Debug, Default, Clone, Serialize)]
pub struct LaneCounters {
    #[serde(rename = "rtcPerf")]
    pub rtc_perf: u64,
    #[serde(rename = "wsImmediate")]
    pub ws_immediate: u64,
}

impl LaneCounters {
    pub fn build() -> LaneCounters {
        LaneCounters::default()
    }
    pub fn reset(&mut self) -> () {
        self.rtc_perf = 0;
        self.ws_immediate = 0;
    }
}

/// build one `jcmp-stats` frame from the aggregate engine state
pub fn build_stats(
    now: u128,
    queue_len: usize,
    counters: &LaneCounters,
    registry: &ClientRegistry,
) -> Value {
    let clients: Vec<Value> = registry
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "bufferSizeMs": c.buffer_depth_ms,
                "rttP95": c.latency.p95(),
                "rttAvg": c.latency.avg(),
                "latencyHistory": c.latency.history(HISTORY_LEN),
                "dcState": c.dc_state.as_str(),
                "lastSeen": c.last_seen.map(|t| t as u64),
            })
        })
        .collect();
    json!({
        "type": "jcmp-stats",
        "serverTime": now as u64,
        "queueLength": queue_len,
        "laneCounters": counters,
        "clients": clients,
    })
}
