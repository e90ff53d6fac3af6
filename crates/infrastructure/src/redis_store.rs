use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use agrotask_domain::{
    DeadLetterPage, FailOutcome, QueueError, QueueResult, QueueStatus, QueueStore, Task, TaskClaim,
    TaskType, WorkerInfo,
};

/// 原子声明脚本：提升到期延迟任务，然后按优先级10..1、同级FIFO扫描，
/// 跳过allow-list之外的类型，命中后置为PROCESSING并返回更新后的记录。
const CLAIM_SCRIPT: &str = r#"
local prefix = ARGV[1]
local now_ms = tonumber(ARGV[2])
local due = redis.call('ZRANGEBYSCORE', prefix..':scheduled', '-inf', now_ms)
for _, id in ipairs(due) do
    redis.call('ZREM', prefix..':scheduled', id)
    local raw = redis.call('GET', prefix..':task:'..id)
    if raw then
        local t = cjson.decode(raw)
        redis.call('RPUSH', prefix..':pending:'..t.priority, id)
    end
end
local allowed = nil
if ARGV[5] ~= '' then
    allowed = {}
    for ty in string.gmatch(ARGV[5], '([^,]+)') do allowed[ty] = true end
end
for prio = 10, 1, -1 do
    local lkey = prefix..':pending:'..prio
    local ids = redis.call('LRANGE', lkey, 0, -1)
    for _, id in ipairs(ids) do
        local raw = redis.call('GET', prefix..':task:'..id)
        if not raw then
            redis.call('LREM', lkey, 1, id)
        else
            local t = cjson.decode(raw)
            if allowed == nil or allowed[t.task_type] then
                redis.call('LREM', lkey, 1, id)
                t.status = 'PROCESSING'
                t.worker_id = ARGV[4]
                t.started_at = ARGV[3]
                local updated = cjson.encode(t)
                redis.call('SET', prefix..':task:'..id, updated)
                redis.call('SADD', prefix..':processing', id)
                return updated
            end
        end
    end
end
return false
"#;

/// 成功结算脚本。返回 1=成功 0=声明丢失 -1=任务不存在。
const COMPLETE_SCRIPT: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local key = prefix..':task:'..id
local raw = redis.call('GET', key)
if not raw then return -1 end
local t = cjson.decode(raw)
if t.status ~= 'PROCESSING' or t.worker_id ~= ARGV[3] or tostring(t.attempts) ~= ARGV[4] then
    return 0
end
t.status = 'COMPLETED'
t.completed_at = ARGV[6]
t.worker_id = nil
t.result = cjson.decode(ARGV[5])
redis.call('SET', key, cjson.encode(t))
redis.call('SREM', prefix..':processing', id)
redis.call('INCR', prefix..':stats:completed')
return 1
"#;

/// 失败结算脚本。ARGV[6]为空串表示死信，否则为重试到期毫秒时间戳。
/// 返回 1=成功 0=声明丢失 -1=任务不存在。
const FAIL_SCRIPT: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local key = prefix..':task:'..id
local raw = redis.call('GET', key)
if not raw then return -1 end
local t = cjson.decode(raw)
if t.status ~= 'PROCESSING' or t.worker_id ~= ARGV[3] or tostring(t.attempts) ~= ARGV[4] then
    return 0
end
t.attempts = t.attempts + 1
t.error = ARGV[5]
t.worker_id = nil
t.started_at = nil
if ARGV[6] == '' then
    t.status = 'FAILED'
    t.completed_at = ARGV[8]
    redis.call('RPUSH', prefix..':dlq', id)
else
    t.status = 'PENDING'
    t.scheduled_at = ARGV[7]
    redis.call('ZADD', prefix..':scheduled', tonumber(ARGV[6]), id)
end
redis.call('SET', key, cjson.encode(t))
redis.call('SREM', prefix..':processing', id)
redis.call('INCR', prefix..':stats:failed')
return 1
"#;

/// 取消脚本：仅PENDING任务。返回 1=成功 0=状态不允许 -1=任务不存在。
const CANCEL_SCRIPT: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local key = prefix..':task:'..id
local raw = redis.call('GET', key)
if not raw then return -1 end
local t = cjson.decode(raw)
if t.status ~= 'PENDING' then return 0 end
t.status = 'CANCELLED'
t.completed_at = ARGV[3]
redis.call('SET', key, cjson.encode(t))
redis.call('LREM', prefix..':pending:'..t.priority, 0, id)
redis.call('ZREM', prefix..':scheduled', id)
return 1
"#;

/// 死信重新入队脚本。返回 1=成功 0=不在死信队列 -1=记录缺失。
const REQUEUE_SCRIPT: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local removed = redis.call('LREM', prefix..':dlq', 0, id)
if removed == 0 then return 0 end
local key = prefix..':task:'..id
local raw = redis.call('GET', key)
if not raw then return -1 end
local t = cjson.decode(raw)
t.status = 'PENDING'
t.attempts = 0
t.scheduled_at = ARGV[3]
t.completed_at = nil
t.worker_id = nil
t.error = nil
t.result = nil
redis.call('SET', key, cjson.encode(t))
redis.call('RPUSH', prefix..':pending:'..t.priority, id)
return 1
"#;

/// Redis Queue Store实现
///
/// 键布局（prefix为命名空间前缀）：
/// - `{prefix}:task:{id}`     任务记录（JSON字符串）
/// - `{prefix}:pending:{1-10}` 按优先级的FIFO列表
/// - `{prefix}:scheduled`     延迟ZSET（score为到期毫秒时间戳）
/// - `{prefix}:processing`    PROCESSING集合
/// - `{prefix}:dlq`           死信列表
/// - `{prefix}:workers`       Worker注册表HASH
/// - `{prefix}:stats:*`       累计计数器
///
/// 跨键状态迁移全部走Lua脚本，脚本即原子性边界。
pub struct RedisQueueStore {
    conn: ConnectionManager,
    prefix: String,
    claim_script: Script,
    complete_script: Script,
    fail_script: Script,
    cancel_script: Script,
    requeue_script: Script,
}

fn store_err(err: redis::RedisError) -> QueueError {
    QueueError::Store(err.to_string())
}

fn to_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl RedisQueueStore {
    pub async fn new(redis_url: &str, prefix: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Store(format!("创建Redis客户端失败: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Store(format!("连接Redis失败: {e}")))?;

        info!("已连接Redis Queue Store (prefix: {})", prefix);
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            claim_script: Script::new(CLAIM_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
        })
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    fn pending_key(&self, priority: u8) -> String {
        format!("{}:pending:{}", self.prefix, priority)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    fn parse_task(&self, raw: &str) -> QueueResult<Task> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::Serialization(format!("任务记录解析失败: {e}")))
    }

    async fn fetch_task(&self, task_id: &str) -> QueueResult<Task> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.task_key(task_id)).await.map_err(store_err)?;
        match raw {
            Some(raw) => self.parse_task(&raw),
            None => Err(QueueError::task_not_found(task_id)),
        }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn insert_task(&self, task: &Task) -> QueueResult<()> {
        let raw = serde_json::to_string(task)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.task_key(&task.id), &raw).ignore();
        if task.scheduled_at <= Utc::now() {
            pipe.rpush(self.pending_key(task.priority), &task.id).ignore();
        } else {
            pipe.zadd(
                self.scheduled_key(),
                &task.id,
                task.scheduled_at.timestamp_millis(),
            )
            .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(store_err)?;
        debug!("任务 {} 已写入Redis (优先级 {})", task.id, task.priority);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.task_key(task_id)).await.map_err(store_err)?;
        raw.map(|raw| self.parse_task(&raw)).transpose()
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        allowed_types: Option<&[TaskType]>,
    ) -> QueueResult<Option<Task>> {
        let now = Utc::now();
        let allowed_csv = allowed_types
            .map(|types| {
                types
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .claim_script
            .arg(&self.prefix)
            .arg(now.timestamp_millis())
            .arg(to_rfc3339(now))
            .arg(worker_id)
            .arg(allowed_csv)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        raw.map(|raw| self.parse_task(&raw)).transpose()
    }

    async fn complete_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        result: serde_json::Value,
    ) -> QueueResult<Task> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .complete_script
            .arg(&self.prefix)
            .arg(task_id)
            .arg(&claim.worker_id)
            .arg(claim.attempts)
            .arg(serde_json::to_string(&result)?)
            .arg(to_rfc3339(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match code {
            1 => self.fetch_task(task_id).await,
            0 => Err(QueueError::claim_lost(task_id)),
            _ => Err(QueueError::task_not_found(task_id)),
        }
    }

    async fn fail_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<FailOutcome> {
        let (retry_ms, retry_iso) = match retry_at {
            Some(at) => (at.timestamp_millis().to_string(), to_rfc3339(at)),
            None => (String::new(), String::new()),
        };

        let mut conn = self.conn.clone();
        let code: i64 = self
            .fail_script
            .arg(&self.prefix)
            .arg(task_id)
            .arg(&claim.worker_id)
            .arg(claim.attempts)
            .arg(error)
            .arg(retry_ms)
            .arg(retry_iso)
            .arg(to_rfc3339(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match code {
            1 => Ok(match retry_at {
                Some(at) => FailOutcome::Retried { scheduled_at: at },
                None => FailOutcome::DeadLettered,
            }),
            0 => Err(QueueError::claim_lost(task_id)),
            _ => Err(QueueError::task_not_found(task_id)),
        }
    }

    async fn cancel_task(&self, task_id: &str) -> QueueResult<Task> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .cancel_script
            .arg(&self.prefix)
            .arg(task_id)
            .arg(to_rfc3339(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match code {
            1 => self.fetch_task(task_id).await,
            0 => Err(QueueError::Validation(format!(
                "任务 {task_id} 不是PENDING状态，无法取消"
            ))),
            _ => Err(QueueError::task_not_found(task_id)),
        }
    }

    async fn requeue_dead_task(&self, task_id: &str) -> QueueResult<Task> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .requeue_script
            .arg(&self.prefix)
            .arg(task_id)
            .arg(to_rfc3339(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match code {
            1 => {
                info!("死信任务 {} 已重新入队", task_id);
                self.fetch_task(task_id).await
            }
            0 => Err(QueueError::Validation(format!(
                "任务 {task_id} 不在死信队列中"
            ))),
            _ => Err(QueueError::task_not_found(task_id)),
        }
    }

    async fn list_processing(&self) -> QueueResult<Vec<Task>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.processing_key())
            .await
            .map_err(store_err)?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(self.task_key(&id)).await.map_err(store_err)?;
            if let Some(raw) = raw {
                tasks.push(self.parse_task(&raw)?);
            }
        }
        Ok(tasks)
    }

    async fn list_dead_tasks(&self, offset: u64, limit: u64) -> QueueResult<DeadLetterPage> {
        let mut conn = self.conn.clone();
        let total: u64 = conn.llen(self.dlq_key()).await.map_err(store_err)?;

        let mut tasks = Vec::new();
        if limit > 0 {
            let start = offset as isize;
            let stop = (offset + limit) as isize - 1;
            let ids: Vec<String> = conn
                .lrange(self.dlq_key(), start, stop)
                .await
                .map_err(store_err)?;
            for id in ids {
                let raw: Option<String> = conn.get(self.task_key(&id)).await.map_err(store_err)?;
                if let Some(raw) = raw {
                    tasks.push(self.parse_task(&raw)?);
                }
            }
        }

        Ok(DeadLetterPage {
            tasks,
            total,
            offset,
            limit,
        })
    }

    async fn purge_dead_task(&self, task_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(self.dlq_key(), 0, task_id)
            .await
            .map_err(store_err)?;
        if removed > 0 {
            let _: () = conn.del(self.task_key(task_id)).await.map_err(store_err)?;
            info!("死信任务 {} 已永久删除", task_id);
        }
        Ok(removed > 0)
    }

    async fn queue_status(&self) -> QueueResult<QueueStatus> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();

        let mut visible: u64 = 0;
        for priority in 1..=10u8 {
            let len: u64 = conn
                .llen(self.pending_key(priority))
                .await
                .map_err(store_err)?;
            visible += len;
        }

        let due: u64 = conn
            .zcount(self.scheduled_key(), "-inf", now_ms)
            .await
            .map_err(store_err)?;
        let scheduled_total: u64 = conn.zcard(self.scheduled_key()).await.map_err(store_err)?;
        let processing: u64 = conn.scard(self.processing_key()).await.map_err(store_err)?;
        let completed: Option<u64> = conn
            .get(format!("{}:stats:completed", self.prefix))
            .await
            .map_err(store_err)?;
        let failed: Option<u64> = conn
            .get(format!("{}:stats:failed", self.prefix))
            .await
            .map_err(store_err)?;
        let dlq_size: u64 = conn.llen(self.dlq_key()).await.map_err(store_err)?;

        Ok(QueueStatus {
            total_pending: visible + due,
            scheduled: scheduled_total.saturating_sub(due),
            processing,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            dlq_size,
        })
    }

    async fn register_worker(&self, info: &WorkerInfo) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(info)?;
        let _: () = conn
            .hset(self.workers_key(), &info.id, raw)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_worker(&self, info: &WorkerInfo) -> QueueResult<()> {
        self.register_worker(info).await
    }

    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(self.workers_key(), worker_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_workers(&self) -> QueueResult<Vec<WorkerInfo>> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn.hvals(self.workers_key()).await.map_err(store_err)?;
        let mut workers = Vec::with_capacity(raws.len());
        for raw in raws {
            workers.push(
                serde_json::from_str(&raw)
                    .map_err(|e| QueueError::Serialization(format!("Worker记录解析失败: {e}")))?,
            );
        }
        Ok(workers)
    }

    async fn clear_all(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        let mut keys: Vec<String> = (1..=10u8).map(|p| self.pending_key(p)).collect();
        keys.push(self.scheduled_key());
        keys.push(self.processing_key());
        keys.push(self.dlq_key());
        keys.push(format!("{}:stats:completed", self.prefix));
        keys.push(format!("{}:stats:failed", self.prefix));

        let task_keys: Vec<String> = conn
            .keys(format!("{}:task:*", self.prefix))
            .await
            .map_err(store_err)?;
        keys.extend(task_keys);

        let _: () = conn.del(keys).await.map_err(store_err)?;
        info!("Redis Queue Store已清空 (prefix: {})", self.prefix);
        Ok(())
    }
}
