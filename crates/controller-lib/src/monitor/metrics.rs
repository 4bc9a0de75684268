//! Bounded per-instance metric series

use crate::models::{MetricType, ResourceSample, ResourceUtilization, ServiceId, ServiceMetric};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};

type Series = BTreeMap<MetricType, VecDeque<ServiceMetric>>;

/// Ring buffer per metric type per instance; the oldest samples are evicted
#[derive(Default)]
pub struct MetricsStore {
    series: DashMap<ServiceId, Series>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: ServiceMetric, retention: usize) {
        let mut series = self.series.entry(metric.service_id).or_default();
        let ring = series.entry(metric.metric_type).or_default();
        ring.push_back(metric);
        while ring.len() > retention.max(1) {
            ring.pop_front();
        }
    }

    /// Split a runtime sample into one metric per type
    pub fn record_sample(
        &self,
        service_id: ServiceId,
        sample: &ResourceSample,
        retention: usize,
        collected_at: DateTime<Utc>,
    ) {
        for (metric_type, value) in sample.values() {
            self.record(
                ServiceMetric {
                    service_id,
                    metric_type,
                    value,
                    unit: metric_type.unit().to_string(),
                    collected_at,
                },
                retention,
            );
        }
    }

    /// Most recent sample per type, computed on read
    pub fn utilization(&self, id: &ServiceId) -> ResourceUtilization {
        let Some(entry) = self.series.get(id) else {
            return ResourceUtilization::default();
        };
        let series: &Series = entry.value();
        let latest = |t: MetricType| series.get(&t).and_then(|r| r.back());
        let value = |t: MetricType| latest(t).map(|m| m.value);

        ResourceUtilization {
            cpu_percent: value(MetricType::CpuPercent),
            memory_percent: value(MetricType::MemoryPercent),
            memory_usage_bytes: value(MetricType::MemoryUsageBytes),
            network_rx_bytes: value(MetricType::NetworkRxBytes),
            network_tx_bytes: value(MetricType::NetworkTxBytes),
            disk_read_bytes: value(MetricType::DiskReadBytes),
            disk_write_bytes: value(MetricType::DiskWriteBytes),
            response_time_ms: value(MetricType::ResponseTimeMs),
            sampled_at: MetricType::ALL
                .iter()
                .filter_map(|t| latest(*t).map(|m| m.collected_at))
                .max(),
        }
    }

    /// Samples of one type, oldest first
    pub fn series(&self, id: &ServiceId, metric_type: MetricType) -> Vec<ServiceMetric> {
        self.series
            .get(id)
            .and_then(|s| s.get(&metric_type).map(|r| r.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn remove(&self, id: &ServiceId) {
        self.series.remove(id);
    }
}
