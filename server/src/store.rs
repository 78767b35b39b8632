//! Results aggregator and incident engine — the heart of the coordinator.
//!
//! Owns the per-(agent, target, day) downtime records and the derived
//! per-target consensus map. A single writer lock around both serialises
//! mutating operations per the scheduling model; reads take a shared lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use shared::api::{LatencyPoint, TargetUptimeEntry, WindowUptime};
use shared::defaults::{MIN_AGENTS_FOR_DOWNTIME, RESPONSE_BUCKET_WIDTH_MS};
use shared::model::{CheckResult, DailyDowntimeRecord, DowntimeIncident, TargetStatus};
use shared::persist;
use shared::utils::{bucket_start_ms, current_timestamp_millis, date_string_local, day_start_ms};
use tokio::sync::RwLock;
use tracing::info;

use crate::alert::AlertSink;
use crate::cache::QueryCache;

/// `agentId -> targetId -> date -> DailyDowntimeRecord`, matching the
/// persisted schema of `data/db/results.json` exactly.
type ResultsDocument = HashMap<String, HashMap<u64, HashMap<String, DailyDowntimeRecord>>>;

struct Inner {
    by_agent: ResultsDocument,
    target_status: HashMap<u64, TargetStatus>,
}

pub struct ResultsStore {
    path: PathBuf,
    inner: RwLock<Inner>,
    alert: Arc<AlertSink>,
    pub latency_cache: QueryCache<String, shared::api::LatencyResponse>,
    pub uptime_cache: QueryCache<String, shared::api::UptimeResponse>,
    pub target_status_cache: QueryCache<String, shared::api::TargetStatusResponse>,
}

impl ResultsStore {
    pub fn load(path: PathBuf, alert: Arc<AlertSink>) -> Result<Self> {
        let by_agent: ResultsDocument = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                by_agent,
                target_status: HashMap::new(),
            }),
            alert,
            latency_cache: QueryCache::new(shared::defaults::QUERY_CACHE_TTL),
            uptime_cache: QueryCache::new(shared::defaults::QUERY_CACHE_TTL),
            target_status_cache: QueryCache::new(shared::defaults::QUERY_CACHE_TTL),
        })
    }

    fn invalidate_caches(&self) {
        self.latency_cache.invalidate();
        self.uptime_cache.invalidate();
        self.target_status_cache.invalidate();
    }

    /// Processes a batch of submitted results in arrival order, persists
    /// once, and invalidates the read caches. Returns the number accepted.
    pub async fn submit(&self, results: Vec<CheckResult>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut transitions: Vec<(u64, bool, Option<String>)> = Vec::new();

        for result in &results {
            let own_date = date_string_local(result.timestamp);

            // Step 1-2: fold successful response time into the submitting
            // agent's bucket for this day.
            if result.success {
                if let Some(rt) = result.response_time_ms {
                    let record = record_mut(&mut inner.by_agent, &result.agent_id, result.target_id, &own_date);
                    record
                        .bucket_mut(bucket_start_ms(result.timestamp), RESPONSE_BUCKET_WIDTH_MS)
                        .fold(rt);
                }
            } else {
                // Ensure the record exists even for a failure-only day so
                // downtime bookkeeping below has somewhere to land.
                record_mut(&mut inner.by_agent, &result.agent_id, result.target_id, &own_date);
            }

            // Step 3-4: update this agent's report and re-evaluate consensus.
            let status = inner.target_status.entry(result.target_id).or_default();
            status
                .agents_reporting
                .insert(result.agent_id.clone(), !result.success);
            let was_down = status.is_down;
            status.recompute_consensus(MIN_AGENTS_FOR_DOWNTIME);
            status.last_updated = result.timestamp;
            let now_down = status.is_down;
            let reporters: Vec<String> = status.agents_reporting.keys().cloned().collect();

            // Step 5: drive the incident state machine for every agent
            // currently reporting this target, not just the submitter — the
            // per-(agent,target) flag tracks global consensus, not the
            // submitter's own view. A DOWN→UP transition must close the
            // incident wherever it actually lives, which on a day rollover
            // is an earlier day's record, not `own_date`'s.
            if was_down != now_down {
                for agent_id in &reporters {
                    let target_date = if now_down {
                        own_date.clone()
                    } else {
                        open_record_date(&inner.by_agent, agent_id, result.target_id)
                            .unwrap_or_else(|| own_date.clone())
                    };
                    let record = record_mut(&mut inner.by_agent, agent_id, result.target_id, &target_date);
                    apply_transition(record, now_down, result.timestamp);
                }
                transitions.push((result.target_id, now_down, result.error_text.clone()));
            }
        }

        persist::write_json_atomic(&self.path, &inner.by_agent)?;
        drop(inner);
        self.invalidate_caches();

        for (target_id, is_down, error_text) in transitions {
            let message = if is_down {
                format!("target {target_id} is DOWN{}", error_text.map(|e| format!(": {e}")).unwrap_or_default())
            } else {
                format!("target {target_id} recovered")
            };
            self.alert.send_alert(&message, Some(&target_id.to_string()), None).await;
        }

        Ok(results.len())
    }

    /// `getDailyDowntimeSummary(date)` → `{agentId -> {targetId -> totalDowntimeMs}}`.
    pub async fn daily_downtime_summary(&self, date: &str) -> HashMap<String, HashMap<u64, u64>> {
        let inner = self.inner.read().await;
        let now = current_timestamp_millis();
        let mut out = HashMap::new();
        for (agent_id, by_target) in &inner.by_agent {
            let mut per_target = HashMap::new();
            for (target_id, by_date) in by_target {
                if let Some(record) = by_date.get(date) {
                    per_target.insert(*target_id, record.downtime_as_of(now));
                }
            }
            if !per_target.is_empty() {
                out.insert(agent_id.clone(), per_target);
            }
        }
        out
    }

    /// `getResponseTimeAverages` / `/api/latency` backing query: per-target
    /// series, merging same-timestamp buckets across agents with a
    /// count-weighted mean.
    pub async fn latency_series(
        &self,
        target_filter: Option<u64>,
        date_filter: Option<&str>,
    ) -> HashMap<String, Vec<LatencyPoint>> {
        let inner = self.inner.read().await;
        let mut merged: HashMap<u64, HashMap<u64, (f64, u64)>> = HashMap::new();

        for by_target in inner.by_agent.values() {
            for (&target_id, by_date) in by_target {
                if let Some(tf) = target_filter {
                    if tf != target_id {
                        continue;
                    }
                }
                for (date, record) in by_date {
                    if let Some(df) = date_filter {
                        if df != date {
                            continue;
                        }
                    }
                    let slot = merged.entry(target_id).or_default();
                    for bucket in &record.response_time_intervals {
                        let entry = slot.entry(bucket.start_time).or_insert((0.0, 0));
                        let total = entry.0 * entry.1 as f64 + bucket.avg_response_time * bucket.count as f64;
                        entry.1 += bucket.count;
                        entry.0 = total / entry.1 as f64;
                    }
                }
            }
        }

        merged
            .into_iter()
            .map(|(target_id, points)| {
                let mut series: Vec<LatencyPoint> = points
                    .into_iter()
                    .map(|(timestamp, (value, _))| LatencyPoint { timestamp, value })
                    .collect();
                series.sort_by_key(|p| p.timestamp);
                (target_id.to_string(), series)
            })
            .collect()
    }

    /// `/api/uptime?targetId?&date?` backing query.
    pub async fn uptime_for_date(
        &self,
        target_filter: Option<u64>,
        date: &str,
    ) -> HashMap<u64, TargetUptimeEntry> {
        let inner = self.inner.read().await;
        let window_start = day_start_ms(parse_date_to_millis(date));
        let window_end = window_start + 86_400_000;

        let target_ids: HashSet<u64> = inner
            .by_agent
            .values()
            .flat_map(|by_target| by_target.keys().copied())
            .filter(|id| target_filter.map(|f| f == *id).unwrap_or(true))
            .collect();

        let mut out = HashMap::new();
        for target_id in target_ids {
            let agent_ids: Vec<&String> = inner
                .by_agent
                .iter()
                .filter(|(_, by_target)| by_target.contains_key(&target_id))
                .map(|(agent_id, _)| agent_id)
                .collect();

            let (downtime, still_down) = fuse_downtime(
                &inner.by_agent,
                &agent_ids,
                target_id,
                window_start,
                window_end,
                MIN_AGENTS_FOR_DOWNTIME,
            );

            let mut agent_reports = HashMap::new();
            let mut weighted_total = 0.0;
            let mut weighted_count = 0u64;
            for agent_id in &agent_ids {
                if let Some(record) = inner.by_agent[*agent_id][&target_id].get(date) {
                    agent_reports.insert((*agent_id).clone(), record.is_down);
                    for bucket in &record.response_time_intervals {
                        weighted_total += bucket.avg_response_time * bucket.count as f64;
                        weighted_count += bucket.count;
                    }
                }
            }

            let window = (window_end - window_start) as f64;
            let uptime_percentage = (100.0 * (1.0 - downtime as f64 / window)).clamp(0.0, 100.0);

            out.insert(
                target_id,
                TargetUptimeEntry {
                    is_down: still_down,
                    downtime_ms: downtime,
                    uptime_percentage: round2(uptime_percentage),
                    avg_response_time: if weighted_count > 0 {
                        Some(weighted_total / weighted_count as f64)
                    } else {
                        None
                    },
                    agent_reports,
                },
            );
        }
        out
    }

    /// `getUptimePercentages(targetId)` → day/week/month/year windows.
    pub async fn uptime_percentages(&self, target_id: u64) -> WindowUptime {
        let inner = self.inner.read().await;
        let now = current_timestamp_millis();
        let agent_ids: Vec<&String> = inner
            .by_agent
            .iter()
            .filter(|(_, by_target)| by_target.contains_key(&target_id))
            .map(|(agent_id, _)| agent_id)
            .collect();

        let window_pct = |days: i64| {
            let lookback_days = days.min(shared::defaults::UPTIME_LOOKBACK_DAYS);
            let window_start = now.saturating_sub((lookback_days as u64) * 86_400_000);
            let (downtime, _) = fuse_downtime(
                &inner.by_agent,
                &agent_ids,
                target_id,
                window_start,
                now,
                MIN_AGENTS_FOR_DOWNTIME,
            );
            let window = (now - window_start).max(1) as f64;
            round2((100.0 * (1.0 - downtime as f64 / window)).clamp(0.0, 100.0))
        };

        WindowUptime {
            day: window_pct(1),
            week: window_pct(7),
            month: window_pct(30),
            year: window_pct(365),
        }
    }

    pub async fn all_target_statuses(&self) -> HashMap<u64, TargetStatus> {
        self.inner.read().await.target_status.clone()
    }

    /// Opt-in retention: drops any daily record whose date is older than
    /// `horizon_days`. Run once at startup when `RETENTION_DAYS` is set; the
    /// protocol has no default pruning, so this only ever runs on request.
    pub async fn prune_older_than(&self, horizon_days: u32) -> Result<usize> {
        let cutoff = current_timestamp_millis().saturating_sub(horizon_days as u64 * 86_400_000);
        let cutoff_date = date_string_local(cutoff);

        let mut inner = self.inner.write().await;
        let mut removed = 0;
        for by_target in inner.by_agent.values_mut() {
            for by_date in by_target.values_mut() {
                let before = by_date.len();
                by_date.retain(|date, _| date.as_str() >= cutoff_date.as_str());
                removed += before - by_date.len();
            }
        }
        if removed > 0 {
            persist::write_json_atomic(&self.path, &inner.by_agent)?;
            info!(removed, cutoff_date, "pruned daily downtime records older than retention horizon");
        }
        Ok(removed)
    }

    /// `resetUptimeData()` — clears the persistent store and in-memory maps.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.by_agent.clear();
        inner.target_status.clear();
        persist::write_json_atomic(&self.path, &inner.by_agent)?;
        drop(inner);
        self.invalidate_caches();
        info!("uptime data reset");
        Ok(())
    }

    /// `/api/uptime/check` — forces a consensus re-evaluation without a new
    /// result, e.g. after an operator edits the target set.
    pub async fn force_reeval(&self, target_id: Option<u64>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = current_timestamp_millis();
        let ids: Vec<u64> = match target_id {
            Some(id) => vec![id],
            None => inner.target_status.keys().copied().collect(),
        };
        for id in ids {
            if let Some(status) = inner.target_status.get_mut(&id) {
                status.recompute_consensus(MIN_AGENTS_FOR_DOWNTIME);
                status.last_updated = now;
            }
        }
        drop(inner);
        self.invalidate_caches();
        Ok(())
    }

    /// Raw, filtered `/api/results` query.
    pub async fn raw_results(
        &self,
        agent_filter: Option<&str>,
        target_filter: Option<u64>,
        date_filter: Option<&str>,
    ) -> ResultsDocument {
        let inner = self.inner.read().await;
        let mut out: ResultsDocument = HashMap::new();
        for (agent_id, by_target) in &inner.by_agent {
            if let Some(af) = agent_filter {
                if af != agent_id {
                    continue;
                }
            }
            for (&target_id, by_date) in by_target {
                if let Some(tf) = target_filter {
                    if tf != target_id {
                        continue;
                    }
                }
                for (date, record) in by_date {
                    if let Some(df) = date_filter {
                        if df != date {
                            continue;
                        }
                    }
                    out.entry(agent_id.clone())
                        .or_default()
                        .entry(target_id)
                        .or_default()
                        .insert(date.clone(), record.clone());
                }
            }
        }
        out
    }
}

/// Finds the date of the record currently holding `agent_id`'s open incident
/// for `target_id`, if any. At most one dated record per (agent, target)
/// should have `is_down == true` at a time, so a recovery event that arrives
/// on a later day than the one the incident opened on still needs to close
/// the record where it actually lives rather than `own_date`'s.
fn open_record_date(by_agent: &ResultsDocument, agent_id: &str, target_id: u64) -> Option<String> {
    by_agent
        .get(agent_id)?
        .get(&target_id)?
        .iter()
        .find(|(_, record)| record.is_down)
        .map(|(date, _)| date.clone())
}

fn record_mut<'a>(
    by_agent: &'a mut ResultsDocument,
    agent_id: &str,
    target_id: u64,
    date: &str,
) -> &'a mut DailyDowntimeRecord {
    by_agent
        .entry(agent_id.to_string())
        .or_default()
        .entry(target_id)
        .or_default()
        .entry(date.to_string())
        .or_insert_with(|| DailyDowntimeRecord::new(date.to_string()))
}

/// Opens, closes, or no-ops the incident timeline on `record` per the
/// consensus transition. Guards against an out-of-order result rewinding an
/// already-advanced timeline: an event older than the last incident's most
/// recent boundary folds into buckets (already done by the caller) but does
/// not touch the incident list.
fn apply_transition(record: &mut DailyDowntimeRecord, now_down: bool, event_time: u64) {
    if let Some(last) = record.incidents.last() {
        let boundary = last.end_time.unwrap_or(last.start_time);
        if event_time < boundary {
            return;
        }
    }

    if now_down && !record.is_down {
        record.incidents.push(DowntimeIncident {
            start_time: event_time,
            end_time: None,
        });
        record.is_down = true;
    } else if !now_down && record.is_down {
        if let Some(last) = record.incidents.last_mut() {
            if last.is_open() {
                last.end_time = Some(event_time);
                record.downtime_ms += last.duration_ms(event_time);
            }
        }
        record.is_down = false;
    }
}

/// Multi-agent uptime fusion over `[window_start, window_end)`: sweeps a
/// boundary-event timeline built from every agent's incidents for `target_id`,
/// clipped to the window, and returns (fused downtime, still-down-at-end).
fn fuse_downtime(
    by_agent: &ResultsDocument,
    agent_ids: &[&String],
    target_id: u64,
    window_start: u64,
    window_end: u64,
    min_agents: usize,
) -> (u64, bool) {
    if window_end <= window_start {
        return (0, false);
    }

    let mut events: Vec<(u64, i32)> = Vec::new();
    for date in dates_between(window_start, window_end) {
        for agent_id in agent_ids {
            let Some(by_target) = by_agent.get(*agent_id) else { continue };
            let Some(by_date) = by_target.get(&target_id) else { continue };
            let Some(record) = by_date.get(&date) else { continue };
            for incident in &record.incidents {
                let start = incident.start_time.max(window_start);
                let end = incident.end_time.unwrap_or(window_end).min(window_end);
                if end > start {
                    events.push((start, 1));
                    events.push((end, -1));
                }
            }
        }
    }

    // End events before start events at the same instant, so a
    // back-to-back incident boundary doesn't double-count a zero-length gap.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut concurrent = 0i32;
    let mut downtime = 0u64;
    let mut last_time = window_start;
    for (time, delta) in &events {
        if concurrent >= min_agents as i32 {
            downtime += time - last_time;
        }
        concurrent += delta;
        last_time = *time;
    }

    (downtime, concurrent >= min_agents as i32)
}

fn dates_between(start_ms: u64, end_ms: u64) -> Vec<String> {
    let mut dates = Vec::new();
    let mut cursor = day_start_ms(start_ms);
    let end = end_ms.max(start_ms + 1);
    while cursor < end {
        dates.push(date_string_local(cursor));
        cursor += 86_400_000;
    }
    dates
}

fn parse_date_to_millis(date: &str) -> u64 {
    use chrono::{Local, NaiveDate, TimeZone};
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| Local.from_local_datetime(&dt).single())
        .map(|dt| dt.timestamp_millis() as u64)
        .unwrap_or_else(current_timestamp_millis)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(target_id: u64, agent_id: &str, timestamp: u64, success: bool, rt: Option<f64>) -> CheckResult {
        CheckResult {
            target_id,
            agent_id: agent_id.to_string(),
            timestamp,
            success,
            response_time_ms: rt,
            status_code: None,
            error_text: None,
        }
    }

    async fn store() -> ResultsStore {
        let dir = tempfile::tempdir().unwrap();
        ResultsStore::load(dir.path().join("results.json"), Arc::new(AlertSink::new(None))).unwrap()
    }

    #[tokio::test]
    async fn single_agent_outage_opens_and_closes_one_incident() {
        let store = store().await;
        store
            .submit(vec![
                result(1, "agent-1", 0, true, Some(10.0)),
                result(1, "agent-1", 1_000, false, None),
                result(1, "agent-1", 2_000, false, None),
                result(1, "agent-1", 3_000, true, Some(5.0)),
            ])
            .await
            .unwrap();

        let date = date_string_local(0);
        let raw = store.raw_results(Some("agent-1"), Some(1), Some(&date)).await;
        let record = &raw["agent-1"][&1][&date];
        assert_eq!(record.incidents.len(), 1);
        assert_eq!(record.incidents[0].start_time, 1_000);
        assert_eq!(record.incidents[0].end_time, Some(3_000));
        assert_eq!(record.downtime_ms, 2_000);
        assert!(!record.is_down);
    }

    #[tokio::test]
    async fn flaky_minority_does_not_open_incident_until_threshold_met() {
        let store = store().await;
        store
            .submit(vec![
                result(2, "A", 0, true, None),
                result(2, "B", 0, true, None),
            ])
            .await
            .unwrap();
        store.submit(vec![result(2, "A", 10_000, false, None)]).await.unwrap();

        let date = date_string_local(0);
        let raw = store.raw_results(None, Some(2), Some(&date)).await;
        assert!(raw["A"][&2][&date].incidents.is_empty());

        store.submit(vec![result(2, "B", 20_000, false, None)]).await.unwrap();
        let raw = store.raw_results(None, Some(2), Some(&date)).await;
        assert_eq!(raw["A"][&2][&date].incidents.len(), 1);
        assert_eq!(raw["A"][&2][&date].incidents[0].start_time, 20_000);
        assert_eq!(raw["B"][&2][&date].incidents[0].start_time, 20_000);

        store.submit(vec![result(2, "A", 30_000, true, None)]).await.unwrap();
        let raw = store.raw_results(None, Some(2), Some(&date)).await;
        assert_eq!(raw["A"][&2][&date].incidents[0].end_time, Some(30_000));
        assert!(raw["B"][&2][&date].incidents[0].end_time.is_none());
    }

    #[tokio::test]
    async fn recovery_after_day_rollover_closes_the_original_days_incident() {
        let store = store().await;
        let day_one = date_string_local(0);
        let next_day_ts = 86_400_000; // +1 day
        let day_two = date_string_local(next_day_ts);
        assert_ne!(day_one, day_two, "test requires two distinct local dates");

        store.submit(vec![result(1, "agent-1", 0, false, None)]).await.unwrap();
        store
            .submit(vec![result(1, "agent-1", next_day_ts, true, Some(5.0))])
            .await
            .unwrap();

        let raw = store.raw_results(Some("agent-1"), Some(1), None).await;
        let day_one_record = &raw["agent-1"][&1][&day_one];
        assert_eq!(day_one_record.incidents.len(), 1);
        assert_eq!(day_one_record.incidents[0].end_time, Some(next_day_ts));
        assert_eq!(day_one_record.downtime_ms, next_day_ts);
        assert!(!day_one_record.is_down);

        // No spurious empty record left open on the rollover day.
        match raw["agent-1"][&1].get(&day_two) {
            None => {}
            Some(day_two_record) => assert!(day_two_record.incidents.is_empty()),
        }
    }

    #[tokio::test]
    async fn consensus_uptime_fusion_matches_overlap_window() {
        let store = store().await;
        // A down [0, 20min], B down [10, 30min], C never down, in a 1h window.
        store.submit(vec![
            result(7, "A", 1, false, None),
            result(7, "B", 1, true, None),
            result(7, "C", 1, true, None),
        ]).await.unwrap();
        store.submit(vec![result(7, "B", 10 * 60_000, false, None)]).await.unwrap();
        store.submit(vec![result(7, "A", 20 * 60_000, true, None)]).await.unwrap();
        store.submit(vec![result(7, "B", 30 * 60_000, true, None)]).await.unwrap();

        let inner = store.inner.read().await;
        let agent_ids: Vec<&String> = inner.by_agent.keys().collect();
        let (downtime, _) = fuse_downtime(&inner.by_agent, &agent_ids, 7, 0, 60 * 60_000, 2);
        assert_eq!(downtime, 10 * 60_000);
    }

    #[tokio::test]
    async fn bucket_averages_are_weighted_across_agents() {
        let store = store().await;
        store.submit(vec![result(1, "A", 0, true, Some(100.0))]).await.unwrap();
        store.submit(vec![result(1, "B", 0, true, Some(200.0))]).await.unwrap();
        let series = store.latency_series(Some(1), None).await;
        assert_eq!(series["1"][0].value, 150.0);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = store().await;
        store.submit(vec![result(1, "A", 0, false, None)]).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.all_target_statuses().await.is_empty());
        assert!(store.raw_results(None, None, None).await.is_empty());
    }
}
