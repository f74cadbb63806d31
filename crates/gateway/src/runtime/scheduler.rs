//! Scheduler — persisted timers that admit synthetic runs with a fixed
//! prompt on a timezone-aware cadence.
//!
//! `next_run_at` always advances from its previous value (never from
//! `now`), under the skip policy: after a pause, it jumps to the first
//! future boundary instead of firing a catch-up burst. A schedule whose
//! previous run is still non-terminal skips the tick and counts a miss.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ab_domain::run::{RunKind, RunOrigin};
use ab_domain::{Error, Result};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Every N seconds (`spec` = seconds).
    Interval,
    /// Once a day at `spec` = "HH:MM" in the schedule's timezone.
    Daily,
    /// 5-field cron expression evaluated in the schedule's timezone.
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub name: String,
    pub kind: ScheduleKind,
    pub spec: String,
    /// Literal text fed as the run input on each fire.
    pub prompt: String,
    pub enabled: bool,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Ticks skipped because the previous run was still active.
    #[serde(default)]
    pub missed: u64,
}

impl Schedule {
    pub fn tz(&self) -> chrono_tz::Tz {
        parse_tz(&self.timezone)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timezone & cron evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse an IANA timezone, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check if a **local** naive datetime matches a 5-field cron expression.
fn cron_matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next cron occurrence strictly after `after`, evaluated in `tz`.
///
/// DST handling: local times inside a spring-forward gap are skipped;
/// fall-back overlaps take the earliest mapping.
pub fn cron_next_tz(cron: &str, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz).naive_local();
    let next_min_secs = 60 - i64::from(local_after.second());
    let mut candidate = local_after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if cron_matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap — this local minute doesn't exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Boundary arithmetic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The first boundary strictly after `after`.
pub fn next_boundary(
    kind: ScheduleKind,
    spec: &str,
    tz: chrono_tz::Tz,
    after: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match kind {
        ScheduleKind::Interval => {
            let secs: i64 = spec.parse().ok().filter(|s| *s > 0)?;
            Some(*after + chrono::Duration::seconds(secs))
        }
        ScheduleKind::Daily => {
            let time = NaiveTime::parse_from_str(spec, "%H:%M").ok()?;
            let local = after.with_timezone(&tz);
            let mut candidate = local.date_naive().and_time(time);
            if candidate <= local.naive_local() {
                candidate += chrono::Duration::days(1);
            }
            // Step over DST gaps day by day.
            for _ in 0..3 {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc));
                    }
                    chrono::LocalResult::None => candidate += chrono::Duration::days(1),
                }
            }
            None
        }
        ScheduleKind::Cron => cron_next_tz(spec, after, tz),
    }
}

/// Advance `next_run_at` under the skip policy: step from its current
/// value to the first boundary after `now`, without firing for the
/// intermediate windows.
pub fn advance_skip(
    kind: ScheduleKind,
    spec: &str,
    tz: chrono_tz::Tz,
    current_next: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if kind == ScheduleKind::Interval {
        // Closed form: current + k·interval for the smallest k > 0 that
        // lands in the future.
        let secs: i64 = spec.parse().ok().filter(|s| *s > 0)?;
        let behind = (*now - *current_next).num_seconds();
        let k = if behind < 0 { 1 } else { behind / secs + 1 };
        return Some(*current_next + chrono::Duration::seconds(secs * k));
    }

    let mut next = next_boundary(kind, spec, tz, current_next)?;
    // Bounded walk; daily/cron boundaries are at least a minute apart.
    for _ in 0..100_000 {
        if next > *now {
            return Some(next);
        }
        next = next_boundary(kind, spec, tz, &next)?;
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store (JSON snapshot)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScheduleStore {
    path: PathBuf,
    schedules: RwLock<Vec<Schedule>>,
}

impl ScheduleStore {
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("schedules.json");
        let schedules = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "schedules snapshot unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            schedules: RwLock::new(schedules),
        })
    }

    /// Validate a spec for its kind.
    pub fn validate_spec(kind: ScheduleKind, spec: &str) -> Result<()> {
        let ok = match kind {
            ScheduleKind::Interval => spec.parse::<i64>().map(|s| s > 0).unwrap_or(false),
            ScheduleKind::Daily => NaiveTime::parse_from_str(spec, "%H:%M").is_ok(),
            ScheduleKind::Cron => spec.split_whitespace().count() == 5,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "invalid {kind:?} spec: {spec:?}"
            )))
        }
    }

    pub fn create(
        &self,
        name: &str,
        kind: ScheduleKind,
        spec: &str,
        prompt: &str,
        timezone: &str,
        enabled: bool,
    ) -> Result<Schedule> {
        Self::validate_spec(kind, spec)?;
        let tz = parse_tz(timezone);
        let now = Utc::now();
        let schedule = Schedule {
            schedule_id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            spec: spec.to_string(),
            prompt: prompt.to_string(),
            enabled,
            timezone: timezone.to_string(),
            created_at: now,
            last_run_id: None,
            last_run_at: None,
            next_run_at: next_boundary(kind, spec, tz, &now),
            missed: 0,
        };
        let mut schedules = self.schedules.write();
        schedules.push(schedule.clone());
        self.persist(&schedules)?;
        Ok(schedule)
    }

    pub fn update<F>(&self, schedule_id: &Uuid, f: F) -> Result<Option<Schedule>>
    where
        F: FnOnce(&mut Schedule),
    {
        let mut schedules = self.schedules.write();
        let Some(schedule) = schedules.iter_mut().find(|s| s.schedule_id == *schedule_id) else {
            return Ok(None);
        };
        f(schedule);
        let snapshot = schedule.clone();
        self.persist(&schedules)?;
        Ok(Some(snapshot))
    }

    pub fn delete(&self, schedule_id: &Uuid) -> Result<bool> {
        let mut schedules = self.schedules.write();
        let before = schedules.len();
        schedules.retain(|s| s.schedule_id != *schedule_id);
        let removed = schedules.len() < before;
        if removed {
            self.persist(&schedules)?;
        }
        Ok(removed)
    }

    pub fn get(&self, schedule_id: &Uuid) -> Option<Schedule> {
        self.schedules
            .read()
            .iter()
            .find(|s| s.schedule_id == *schedule_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.read().clone()
    }

    /// Enabled schedules whose `next_run_at` is due.
    pub fn due(&self, now: &DateTime<Utc>) -> Vec<Schedule> {
        self.schedules
            .read()
            .iter()
            .filter(|s| s.enabled && s.next_run_at.is_some_and(|next| next <= *now))
            .cloned()
            .collect()
    }

    /// On startup: reconcile stale `next_run_at` values before the first
    /// tick. All missed windows but the most recent are skipped, so the
    /// first tick fires exactly once and the skip policy takes over from
    /// there. Schedules without a boundary are seeded from `now`.
    pub fn advance_stale(&self, now: &DateTime<Utc>) -> Result<()> {
        let mut schedules = self.schedules.write();
        let mut dirty = false;
        for schedule in schedules.iter_mut() {
            let tz = parse_tz(&schedule.timezone);
            match schedule.next_run_at {
                Some(next) if next <= *now => {
                    schedule.next_run_at = Some(latest_due_boundary(
                        schedule.kind,
                        &schedule.spec,
                        tz,
                        &next,
                        now,
                    ));
                    dirty = true;
                }
                None => {
                    schedule.next_run_at =
                        next_boundary(schedule.kind, &schedule.spec, tz, now);
                    dirty = true;
                }
                _ => {}
            }
        }
        if dirty {
            self.persist(&schedules)?;
        }
        Ok(())
    }

    fn persist(&self, schedules: &[Schedule]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(schedules)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.schedules.read().len()
    }
}

/// The latest boundary ≤ `now` reachable from a stale `next`. This is
/// the one window that still fires after a pause; everything before it
/// is skipped.
fn latest_due_boundary(
    kind: ScheduleKind,
    spec: &str,
    tz: chrono_tz::Tz,
    stale_next: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> DateTime<Utc> {
    if kind == ScheduleKind::Interval {
        if let Ok(secs) = spec.parse::<i64>() {
            if secs > 0 {
                let behind = (*now - *stale_next).num_seconds().max(0);
                return *stale_next + chrono::Duration::seconds((behind / secs) * secs);
            }
        }
        return *stale_next;
    }

    let mut last_due = *stale_next;
    for _ in 0..100_000 {
        match next_boundary(kind, spec, tz, &last_due) {
            Some(next) if next <= *now => last_due = next,
            _ => break,
        }
    }
    last_due
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tick: fire every due schedule whose previous run has finished.
pub async fn tick(state: &AppState) {
    let now = Utc::now();
    for schedule in state.schedules.due(&now) {
        let tz = schedule.tz();

        // Schedule-level lock: while the previous run of this schedule
        // is non-terminal, the tick is skipped and counted as missed.
        let previous_active = schedule
            .last_run_id
            .and_then(|id| state.runs.get(&id))
            .is_some_and(|run| !run.state.is_terminal());
        if previous_active {
            let _ = state.schedules.update(&schedule.schedule_id, |s| {
                s.missed += 1;
                if let Some(next) = s.next_run_at {
                    s.next_run_at = advance_skip(s.kind, &s.spec, tz, &next, &now);
                }
            });
            tracing::debug!(
                schedule_id = %schedule.schedule_id,
                "previous run still active, tick skipped"
            );
            continue;
        }

        let session_id = format!("scheduler:{}", schedule.schedule_id);
        let admitted = super::admit(
            state,
            &session_id,
            RunOrigin::Scheduler {
                schedule_id: schedule.schedule_id,
            },
            RunKind::Scheduled,
            &schedule.prompt,
            Vec::new(),
        );

        match admitted {
            Ok((run_id, _)) => {
                tracing::info!(
                    schedule_id = %schedule.schedule_id,
                    run_id = %run_id,
                    name = %schedule.name,
                    "schedule fired"
                );
                let _ = state.schedules.update(&schedule.schedule_id, |s| {
                    s.last_run_id = Some(run_id);
                    s.last_run_at = Some(now);
                    if let Some(next) = s.next_run_at {
                        // Deterministic advance from the previous
                        // next_run_at, not from now.
                        s.next_run_at = advance_skip(s.kind, &s.spec, tz, &next, &now);
                    }
                });
            }
            Err(e) => {
                tracing::warn!(
                    schedule_id = %schedule.schedule_id,
                    error = %e,
                    "schedule admission failed"
                );
                let _ = state.schedules.update(&schedule.schedule_id, |s| {
                    s.missed += 1;
                    if let Some(next) = s.next_run_at {
                        s.next_run_at = advance_skip(s.kind, &s.spec, tz, &next, &now);
                    }
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
