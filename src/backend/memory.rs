//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内的存储后端实现，用于测试和本地开发。
//!
//! 字符串键空间基于Moka，按条目设置过期时间；集合与消息流保存在一把异步互斥锁之后。
//! 所有写操作都先获取这把锁，因此 `set_nx`、解锁脚本和秒杀脚本与Redis中一样是原子的。

use super::{
    AdmissionKeys, ReadFrom, StoreBackend, StreamEntry, ADMIT_DUPLICATE, ADMIT_NO_STOCK, ADMIT_OK,
};
use crate::error::{FlashError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument};

/// 字符串值及其生存时间
#[derive(Clone, Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    ttl: Option<Duration>,
}

/// 每次写入都以新值自带的TTL重新计时，与Redis `SET EX` 一致
struct TtlExpiry;

impl Expiry<String, StoredValue> for TtlExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FlashError::Store(format!("Invalid stream ID specified: {}", s));
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: HashMap<String, String>) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let id = if now_ms > self.last_id.ms {
            EntryId { ms: now_ms, seq: 0 }
        } else {
            EntryId {
                ms: self.last_id.ms,
                seq: self.last_id.seq + 1,
            }
        };
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }
}

/// 需要多键原子性的数据
#[derive(Debug, Default)]
struct Keyspace {
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamState>,
}

/// 进程内存储后端
pub struct MemoryBackend {
    strings: Cache<String, StoredValue>,
    keyspace: Mutex<Keyspace>,
    stream_notify: Notify,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("string_keys", &self.strings.entry_count())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// 创建空的存储
    ///
    /// 字符串键空间不设容量上限，条目只会因TTL到期而消失，
    /// 与Redis `noeviction` 策略一致：锁、库存和计数器键不会被挤出。
    pub fn new() -> Self {
        Self {
            strings: Cache::builder().expire_after(TtlExpiry).build(),
            keyspace: Mutex::new(Keyspace::default()),
            stream_notify: Notify::new(),
        }
    }

    /// 集合成员（测试辅助）
    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let keyspace = self.keyspace.lock().await;
        let mut members: Vec<String> = keyspace
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// 消息流长度（测试辅助）
    pub async fn stream_len(&self, stream: &str) -> usize {
        let keyspace = self.keyspace.lock().await;
        keyspace
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn parse_integer(bytes: &[u8]) -> Result<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                FlashError::Store("ERR value is not an integer or out of range".to_string())
            })
    }

    fn read_group_locked(
        keyspace: &mut Keyspace,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let no_group = || {
            FlashError::Store(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                stream, group
            ))
        };
        let state = keyspace.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        let mut delivered = Vec::new();
        match from {
            ReadFrom::New => {
                let start = group_state.last_delivered;
                for (id, fields) in entries
                    .range(start..)
                    .filter(|(id, _)| **id > start)
                    .take(count)
                {
                    group_state.last_delivered = *id;
                    group_state.pending.insert(
                        *id,
                        PendingInfo {
                            consumer: consumer.to_string(),
                            deliveries: 1,
                        },
                    );
                    delivered.push(StreamEntry {
                        id: id.to_string(),
                        fields: fields.clone(),
                    });
                }
            }
            ReadFrom::Pending => {
                for (id, info) in group_state
                    .pending
                    .iter_mut()
                    .filter(|(_, info)| info.consumer == consumer)
                    .take(count)
                {
                    info.deliveries += 1;
                    delivered.push(StreamEntry {
                        id: id.to_string(),
                        fields: entries.get(id).cloned().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.strings.get(key).await.map(|v| v.bytes))
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<()> {
        let _guard = self.keyspace.lock().await;
        self.strings
            .insert(
                key.to_string(),
                StoredValue {
                    bytes: value.to_vec(),
                    ttl: ttl.map(Duration::from_secs),
                },
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.keyspace.lock().await;
        if self.strings.get(key).await.is_some() {
            return Ok(false);
        }
        self.strings
            .insert(
                key.to_string(),
                StoredValue {
                    bytes: value.as_bytes().to_vec(),
                    ttl: Some(ttl),
                },
            )
            .await;
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().await;
        self.strings.invalidate(key).await;
        keyspace.sets.remove(key);
        keyspace.streams.remove(key);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn incr(&self, key: &str) -> Result<i64> {
        let _guard = self.keyspace.lock().await;
        let (current, ttl) = match self.strings.get(key).await {
            Some(v) => (Self::parse_integer(&v.bytes)?, v.ttl),
            None => (0, None),
        };
        let next = current + 1;
        self.strings
            .insert(
                key.to_string(),
                StoredValue {
                    bytes: next.to_string().into_bytes(),
                    ttl,
                },
            )
            .await;
        Ok(next)
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let _guard = self.keyspace.lock().await;
        match self.strings.get(key).await {
            Some(v) if v.bytes == token.as_bytes() => {
                self.strings.invalidate(key).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self, keys), level = "debug")]
    async fn admit(
        &self,
        keys: &AdmissionKeys,
        voucher_id: u64,
        user_id: u64,
        order_id: u64,
    ) -> Result<i64> {
        let mut keyspace = self.keyspace.lock().await;

        let stock = match self.strings.get(&keys.stock_key).await {
            Some(v) => Some(Self::parse_integer(&v.bytes)?),
            None => None,
        };
        let stock = match stock {
            Some(s) if s > 0 => s,
            _ => return Ok(ADMIT_NO_STOCK),
        };

        let user = user_id.to_string();
        if keyspace
            .sets
            .get(&keys.order_key)
            .is_some_and(|members| members.contains(&user))
        {
            return Ok(ADMIT_DUPLICATE);
        }

        self.strings
            .insert(
                keys.stock_key.clone(),
                StoredValue {
                    bytes: (stock - 1).to_string().into_bytes(),
                    ttl: None,
                },
            )
            .await;
        keyspace
            .sets
            .entry(keys.order_key.clone())
            .or_default()
            .insert(user.clone());

        let fields = HashMap::from([
            ("userId".to_string(), user),
            ("voucherId".to_string(), voucher_id.to_string()),
            ("id".to_string(), order_id.to_string()),
        ]);
        let id = keyspace
            .streams
            .entry(keys.stream_key.clone())
            .or_default()
            .append(fields);
        drop(keyspace);

        debug!("Admission recorded as stream entry {}", id);
        self.stream_notify.notify_waiters();
        Ok(ADMIT_OK)
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().await;
        let state = keyspace.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = match (from, block) {
            (ReadFrom::New, Some(block)) => Some(tokio::time::Instant::now() + block),
            _ => None,
        };

        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut keyspace = self.keyspace.lock().await;
                let delivered =
                    Self::read_group_locked(&mut keyspace, stream, group, consumer, from, count)?;
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let entry_id: EntryId = id.parse()?;
        let mut keyspace = self.keyspace.lock().await;
        if let Some(group_state) = keyspace
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(&entry_id);
        }
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let keyspace = self.keyspace.lock().await;
        keyspace
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| {
                FlashError::Store(format!(
                    "NOGROUP No such key '{}' or consumer group '{}'",
                    stream, group
                ))
            })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
