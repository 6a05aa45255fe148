//! Redis-backed durable queue.
//!
//! Per queue, under `{prefix}:{queue}`:
//! - `jobs`      HASH  job id -> job JSON
//! - `delayed`   ZSET  job id scored by ready time (ms)
//! - `wait`      LIST  ready job ids, FIFO
//! - `active`    ZSET  leased job ids scored by lease deadline (ms)
//! - `leases`    HASH  job id -> lease token
//! - `completed` / `failed` counters
//!
//! Every state change runs as a Lua script so a job id is in exactly one of
//! `delayed`, `wait` or `active` at any time.

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ensure_queue, ready_at, Job, JobCounts, JobHandle, JobPayload, JobQueue, Lease, QueueError,
    QueueName, QueuePolicy, Settlement,
};
use crate::config::QueueConfig;

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('HDEL', KEYS[4], id)
  redis.call('RPUSH', KEYS[2], id)
end
local id = redis.call('LPOP', KEYS[2])
if not id then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[2], id)
redis.call('HSET', KEYS[4], id, ARGV[3])
return id
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('INCR', KEYS[4])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if ARGV[4] == '1' then
  redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('HDEL', KEYS[3], ARGV[1])
  redis.call('INCR', KEYS[5])
end
return 1
"#;

/// Redis key builder for one queue
#[derive(Debug, Clone)]
struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        Self {
            base: format!("{}:{}", prefix, queue.as_str()),
        }
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.base)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    fn wait(&self) -> String {
        format!("{}:wait", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn leases(&self) -> String {
        format!("{}:leases", self.base)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }
}

fn backend_error(err: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn millis_from_now(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

pub struct RedisJobQueue {
    pool: RedisPool,
    name: QueueName,
    keys: QueueKeys,
    policy: QueuePolicy,
}

impl RedisJobQueue {
    pub fn new(pool: RedisPool, prefix: &str, name: QueueName, policy: QueuePolicy) -> Self {
        Self {
            pool,
            name,
            keys: QueueKeys::new(prefix, name),
            policy,
        }
    }

    /// Drop a leased job that can never be handled and count it as failed
    async fn discard(
        &self,
        conn: &mut ::redis::aio::MultiplexedConnection,
        id: &str,
    ) -> Result<(), QueueError> {
        let _: () = ::redis::pipe()
            .atomic()
            .zrem(self.keys.active(), id)
            .ignore()
            .hdel(self.keys.leases(), id)
            .ignore()
            .hdel(self.keys.jobs(), id)
            .ignore()
            .incr(self.keys.failed(), 1)
            .ignore()
            .query_async(conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    async fn enqueue(&self, payload: JobPayload, delay: Duration) -> Result<JobHandle, QueueError> {
        ensure_queue(self.name, &payload)?;

        let job = Job::new(self.name, payload);
        let id = job.id.to_string();
        let json = serde_json::to_string(&job)?;

        let mut conn = self.pool.get().await.map_err(backend_error)?;
        let mut pipe = ::redis::pipe();
        pipe.atomic().hset(self.keys.jobs(), &id, json).ignore();
        if delay.is_zero() {
            pipe.rpush(self.keys.wait(), &id).ignore();
        } else {
            pipe.zadd(self.keys.delayed(), &id, millis_from_now(delay))
                .ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await.map_err(backend_error)?;

        debug!(queue = %self.name, job_id = %id, delay_ms = delay.as_millis() as u64, "job enqueued");
        Ok(JobHandle {
            id: job.id,
            queue: self.name,
            ready_at: ready_at(delay),
        })
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let token = Uuid::new_v4();
        let mut conn = self.pool.get().await.map_err(backend_error)?;

        let leased: Option<String> = ::redis::Script::new(LEASE_SCRIPT)
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.leases())
            .arg(Utc::now().timestamp_millis())
            .arg(millis_from_now(self.policy.visibility_timeout))
            .arg(token.to_string())
            .invoke_async(&mut *conn)
            .await
            .map_err(backend_error)?;

        let Some(id) = leased else {
            return Ok(None);
        };

        let json: Option<String> = ::redis::cmd("HGET")
            .arg(self.keys.jobs())
            .arg(&id)
            .query_async(&mut *conn)
            .await
            .map_err(backend_error)?;

        let Some(json) = json else {
            error!(queue = %self.name, job_id = %id, "leased job has no stored body");
            self.discard(&mut *conn, &id).await?;
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&json) {
            Ok(job) => Ok(Some(Lease { job, token })),
            Err(e) => {
                // Would otherwise be reclaimed and fail again on every lease
                error!(queue = %self.name, job_id = %id, error = %e, "undecodable job body, marking failed");
                self.discard(&mut *conn, &id).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(backend_error)?;

        let settled: i32 = ::redis::Script::new(COMPLETE_SCRIPT)
            .key(self.keys.active())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .key(self.keys.completed())
            .arg(lease.job.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut *conn)
            .await
            .map_err(backend_error)?;

        if settled == 0 {
            return Err(QueueError::LeaseLost {
                job_id: lease.job.id,
            });
        }
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<Settlement, QueueError> {
        let mut job = lease.job.clone();
        job.attempts_made += 1;
        job.last_error = Some(reason.to_string());

        let retry = job.attempts_made < self.policy.max_attempts;
        let json = serde_json::to_string(&job)?;

        let mut conn = self.pool.get().await.map_err(backend_error)?;
        let settled: i32 = ::redis::Script::new(FAIL_SCRIPT)
            .key(self.keys.active())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .key(self.keys.delayed())
            .key(self.keys.failed())
            .arg(job.id.to_string())
            .arg(lease.token.to_string())
            .arg(json)
            .arg(if retry { "1" } else { "0" })
            .arg(millis_from_now(self.policy.retry_backoff))
            .invoke_async(&mut *conn)
            .await
            .map_err(backend_error)?;

        if settled == 0 {
            return Err(QueueError::LeaseLost { job_id: job.id });
        }

        if retry {
            Ok(Settlement::Retrying {
                attempt: job.attempts_made,
                ready_at: ready_at(self.policy.retry_backoff),
            })
        } else {
            Ok(Settlement::Failed {
                attempts: job.attempts_made,
            })
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.pool.get().await.map_err(backend_error)?;

        let (delayed, wait, active, completed, failed): (u64, u64, u64, Option<u64>, Option<u64>) =
            ::redis::pipe()
                .zcard(self.keys.delayed())
                .llen(self.keys.wait())
                .zcard(self.keys.active())
                .get(self.keys.completed())
                .get(self.keys.failed())
                .query_async(&mut *conn)
                .await
                .map_err(backend_error)?;

        Ok(JobCounts {
            waiting: delayed + wait,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }
}

/// Initialize the Redis connection pool backing the queues
pub async fn init_queue_pool(config: &QueueConfig) -> Result<RedisPool, QueueError> {
    info!(
        max_connections = config.max_connections,
        key_prefix = %config.key_prefix,
        "initializing Redis queue pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!(error = %e, "failed to create Redis connection manager");
        backend_error(e)
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to build Redis connection pool");
            backend_error(e)
        })?;

    if let Err(e) = health_check(&pool).await {
        warn!(error = %e, "initial Redis ping failed, continuing");
    }

    info!("Redis queue pool initialized");
    Ok(pool)
}

/// Health check for the Redis connection pool
pub async fn health_check(pool: &RedisPool) -> Result<(), QueueError> {
    let mut conn = pool.get().await.map_err(backend_error)?;

    let _: String = ::redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(backend_error)?;

    Ok(())
}
