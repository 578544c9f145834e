//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了运行时指标收集。指标实例由调用方创建并注入各组件。

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// 指标收集器
///
/// key: "component:op:result"
#[derive(Debug, Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次事件
    ///
    /// # 参数
    ///
    /// * `component` - 组件（cache/lock/id/admission/consumer）
    /// * `op` - 操作类型
    /// * `result` - 操作结果
    pub fn record(&self, component: &str, op: &str, result: &str) {
        let key = format!("{}:{}:{}", component, op, result);
        trace!(metric = %key, "record");
        if let Some(counter) = self.counters.get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// 读取计数
    pub fn get(&self, component: &str, op: &str, result: &str) -> u64 {
        let key = format!("{}:{}:{}", component, op, result);
        self.counters
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 以Prometheus文本格式输出所有指标
    pub fn render_prometheus(&self) -> String {
        let mut rows: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        rows.sort();

        let mut output = String::new();
        for (key, value) in rows {
            let parts: Vec<&str> = key.splitn(3, ':').collect();
            if parts.len() == 3 {
                output.push_str(&format!(
                    "oxflash_events_total{{component=\"{}\", op=\"{}\", result=\"{}\"}} {}\n",
                    parts[0], parts[1], parts[2], value
                ));
            }
        }
        output
    }
}
