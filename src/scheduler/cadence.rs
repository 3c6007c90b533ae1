use crate::catalog::{QueryCatalog, QueryKind};
use crate::config::SchedulerConfig;
use crate::error::SentryError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// When a query is due.
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron(Box<CronSchedule>),
}

impl Cadence {
    pub fn parse_cron(expr: &str) -> Result<Self, SentryError> {
        let schedule = CronSchedule::from_str(expr)
            .map_err(|e| SentryError::Config(format!("invalid cron expression '{}': {}", expr, e)))?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    /// First trigger after the scheduler starts at `start`.
    /// Intervals fire immediately, cron cadences at their next occurrence.
    pub fn first_due(&self, start: Instant) -> Instant {
        match self {
            Cadence::Every(_) => start,
            Cadence::Cron(schedule) => next_cron_instant(schedule, start),
        }
    }

    /// Next trigger strictly after `now`, given the trigger that just fired.
    pub fn next_after(&self, fired: Instant, now: Instant) -> Instant {
        match self {
            Cadence::Every(period) => {
                let mut next = fired + *period;
                // Collapse missed triggers rather than bursting.
                while next <= now {
                    next += *period;
                }
                next
            }
            Cadence::Cron(schedule) => next_cron_instant(schedule, now),
        }
    }

    /// Wall-clock trigger times in `[from, until]`, lazily.
    fn occurrences<'a>(
        &'a self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Box<dyn Iterator<Item = DateTime<Utc>> + 'a> {
        match self {
            Cadence::Every(period) => {
                let Ok(step) = chrono::Duration::from_std(*period) else {
                    return Box::new(std::iter::once(from));
                };
                Box::new(
                    std::iter::successors(Some(from), move |t| t.checked_add_signed(step))
                        .take_while(move |t| *t <= until),
                )
            }
            Cadence::Cron(schedule) => Box::new(schedule.after(&from).take_while(move |t| *t <= until)),
        }
    }
}

fn next_cron_instant(schedule: &CronSchedule, now: Instant) -> Instant {
    let wall_now = Utc::now();
    match schedule.after(&wall_now).next() {
        Some(next) => now + (next - wall_now).to_std().unwrap_or(Duration::ZERO),
        // Exhausted schedule (e.g. a fixed past year): never due again.
        None => now + Duration::from_secs(100 * 365 * 24 * 3600),
    }
}

/// One scheduled catalog query.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub id: String,
    pub cadence: Cadence,
    pub timeout: Duration,
}

/// The validated set of scheduled queries, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    entries: Vec<PlannedQuery>,
}

impl SchedulePlan {
    pub fn from_config(config: &SchedulerConfig, catalog: &QueryCatalog) -> Result<Self, SentryError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(config.query.len());

        for entry in &config.query {
            let query = catalog.get(&entry.id)?;
            if query.kind == QueryKind::TraceSession {
                return Err(SentryError::Config(format!(
                    "'{}' sets up a trace session and cannot be scheduled",
                    entry.id
                )));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(SentryError::Config(format!("'{}' is scheduled twice", entry.id)));
            }

            let cadence = match (entry.every_secs, entry.cron.as_deref()) {
                (Some(secs), None) if secs > 0 => Cadence::Every(Duration::from_secs(secs)),
                (None, Some(expr)) => Cadence::parse_cron(expr)?,
                _ => {
                    return Err(SentryError::Config(format!(
                        "'{}': set exactly one of every_secs and cron",
                        entry.id
                    )))
                }
            };

            let timeout = entry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.default_timeout());
            entries.push(PlannedQuery {
                id: entry.id.clone(),
                cadence,
                timeout,
            });
        }

        Ok(Self { entries })
    }

    pub fn new(entries: Vec<PlannedQuery>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PlannedQuery] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dry run: the first `limit` triggers in the next `hours`, sorted by time.
    pub fn preview(&self, hours: u64, limit: usize) -> Result<Vec<(DateTime<Utc>, String)>, SentryError> {
        let now = Utc::now();
        let end = i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| SentryError::Config(format!("dry-run window of {} hours is out of range", hours)))?;

        // Any trigger among the first `limit` overall is among the first
        // `limit` of its own cadence.
        let mut preview: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .flat_map(|p| {
                p.cadence
                    .occurrences(now, end)
                    .take(limit)
                    .map(move |t| (t, p.id.clone()))
            })
            .collect();

        preview.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        preview.truncate(limit);
        Ok(preview)
    }
}
