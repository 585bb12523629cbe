//! Delayed-task promoter.
//!
//! Moves due entries from the scheduled sorted set onto their target
//! streams. The whole move runs as one server-side Lua script, so two
//! workers ticking the promoter concurrently can never double-promote an
//! entry. The script is addressed by content hash; `redis::Script` reloads
//! it transparently when the server reports it is not cached.

use crate::error::BackstageError;
use crate::keys::KeySpace;
use crate::message::{now_ms, Priority};
use crate::metrics;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Promotion cadence per worker.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

/// Atomically promotes every member with score <= cutoff. Target stream is
/// the member's own `streamKey` when present; members written without one
/// fall back to `prefix:priority-or-default`. Undecodable members are left
/// in place.
const PROMOTE_SCRIPT: &str = r#"
local zsetKey = KEYS[1]
local cutoff = tonumber(ARGV[1])
local prefix = ARGV[2]
local defaultPriority = ARGV[3]

local tasks = redis.call('ZRANGEBYSCORE', zsetKey, '-inf', cutoff)
local promoted = 0

for _, taskData in ipairs(tasks) do
    local ok, task = pcall(cjson.decode, taskData)
    if ok and task then
        local streamKey = task.streamKey
        if not streamKey then
            local priority = task.priority or defaultPriority
            streamKey = prefix .. ':' .. priority
        end

        local fields = {
            'taskName', task.taskName or '',
            'payload', task.payload or 'null',
            'enqueuedAt', tostring(task.enqueuedAt or 0),
        }
        if task.attempts then
            table.insert(fields, 'attempts')
            table.insert(fields, tostring(task.attempts))
        end
        if task.backoff then
            local backoff = task.backoff
            if type(backoff) ~= 'string' then
                backoff = cjson.encode(backoff)
            end
            table.insert(fields, 'backoff')
            table.insert(fields, backoff)
        end
        if task.timeout then
            table.insert(fields, 'timeout')
            table.insert(fields, tostring(task.timeout))
        end

        redis.call('XADD', streamKey, '*', unpack(fields))
        redis.call('ZREM', zsetKey, taskData)
        promoted = promoted + 1
    end
end

return promoted
"#;

/// Promotes due delayed tasks onto their streams.
pub struct ScheduledPromoter {
    redis: ConnectionManager,
    keys: KeySpace,
    script: Script,
}

impl ScheduledPromoter {
    pub fn new(redis: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            redis,
            keys,
            script: Script::new(PROMOTE_SCRIPT),
        }
    }

    /// Promote every scheduled task due at or before `cutoff_ms`. Returns
    /// the number of promoted entries.
    pub async fn promote_due(&self, cutoff_ms: i64) -> Result<i64, BackstageError> {
        let mut conn = self.redis.clone();

        let promoted: i64 = self
            .script
            .key(self.keys.scheduled())
            .arg(cutoff_ms)
            .arg(self.keys.prefix())
            .arg(Priority::Default.to_string())
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            debug!(promoted, "Promoted scheduled tasks");
            metrics::record_promoted(promoted as u64);
        }

        Ok(promoted)
    }

    /// Tick the promoter about once a second until shutdown.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + PROMOTE_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PROMOTE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = self.promote_due(now_ms()).await {
                        warn!(error = %e, "Promotion tick failed");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
