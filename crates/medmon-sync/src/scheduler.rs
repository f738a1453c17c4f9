//! Due-job evaluation, multi-search aggregation and report dispatch.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc, Weekday};
use medmon_core::{Article, Frequency, ReportJob, RunStatus, SavedSearch, SearchIds, SendTime};
use medmon_storage::Store;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::delivery::Delivery;
use crate::report::render_report;
use crate::search::SearchEngine;
use crate::Clock;

fn passes_frequency_gate(frequency: Frequency, date: NaiveDate) -> bool {
    match frequency {
        Frequency::Daily => true,
        Frequency::Weekly => date.weekday() == Weekday::Mon,
        Frequency::Monthly => date.day() == 1,
    }
}

/// Exact-minute check: the wall-clock hour and minute equal `send_time` and
/// the frequency gate (Monday for weekly, the 1st for monthly) passes.
pub fn is_due(frequency: Frequency, send_time: SendTime, now: NaiveDateTime) -> bool {
    now.hour() == send_time.hour
        && now.minute() == send_time.minute
        && passes_frequency_gate(frequency, now.date())
}

/// `YYYY-MM-DD to YYYY-MM-DD`, looking back 1, 7 or 30 days.
pub fn period_label(frequency: Frequency, now: DateTime<FixedOffset>) -> String {
    let days = match frequency {
        Frequency::Daily => 1,
        Frequency::Weekly => 7,
        Frequency::Monthly => 30,
    };
    let start = now - Duration::days(days);
    format!("{} to {}", start.format("%Y-%m-%d"), now.format("%Y-%m-%d"))
}

pub fn report_subject(job_name: &str) -> String {
    format!("Media report: {job_name}")
}

/// When a job counts as due. A slot stays open for `catch_up` after the send
/// time (at least one minute) and closes once the job has run since the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuePolicy {
    pub catch_up: Duration,
}

impl Default for DuePolicy {
    fn default() -> Self {
        Self::with_catch_up_minutes(10)
    }
}

impl DuePolicy {
    /// Only the send minute itself.
    pub fn exact() -> Self {
        Self {
            catch_up: Duration::zero(),
        }
    }

    pub fn with_catch_up_minutes(minutes: u32) -> Self {
        Self {
            catch_up: Duration::minutes(i64::from(minutes)),
        }
    }

    pub fn is_due(&self, job: &ReportJob, now: DateTime<FixedOffset>) -> bool {
        self.open_slot(job, now).is_some()
    }

    /// Start of the slot that is open for `job` at `now`, if any.
    pub fn open_slot(&self, job: &ReportJob, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let local = now.naive_local();
        let window = self.catch_up.max(Duration::minutes(1));
        let last_run = job
            .last_run_at
            .map(|ts| ts.with_timezone(now.offset()).naive_local());

        // Yesterday's slot can still be open shortly after midnight.
        [local.date(), local.date() - Duration::days(1)]
            .into_iter()
            .filter(|date| passes_frequency_gate(job.frequency, *date))
            .filter_map(|date| date.and_hms_opt(job.send_time.hour, job.send_time.minute, 0))
            .find(|slot| {
                *slot <= local && local < *slot + window && last_run.map_or(true, |last| last < *slot)
            })
            .and_then(|slot| slot.and_local_timezone(*now.offset()).single())
    }
}

/// What happened to one attempted job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Option<i64>,
    pub job_name: String,
    pub status: RunStatus,
    pub articles: usize,
}

#[derive(Debug, Clone)]
pub struct DueRunSummary {
    pub now: DateTime<FixedOffset>,
    /// Enabled jobs that were checked.
    pub evaluated: usize,
    /// Rows that could not be read as jobs.
    pub unreadable: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl DueRunSummary {
    fn empty(now: DateTime<FixedOffset>) -> Self {
        Self {
            now,
            evaluated: 0,
            unreadable: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.status.is_ok()).count()
    }
}

pub struct ReportScheduler {
    store: Store,
    search: SearchEngine,
    delivery: Arc<dyn Delivery>,
    clock: Arc<dyn Clock>,
    policy: DuePolicy,
}

impl ReportScheduler {
    pub fn new(
        store: Store,
        search: SearchEngine,
        delivery: Arc<dyn Delivery>,
        clock: Arc<dyn Clock>,
        policy: DuePolicy,
    ) -> Self {
        Self {
            store,
            search,
            delivery,
            clock,
            policy,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Attempts every enabled job that is due at `now`. Never fails; per-job
    /// problems end up in the job's stored status.
    pub async fn run_due_reports(&self, now: DateTime<FixedOffset>) -> DueRunSummary {
        let mut summary = DueRunSummary::empty(now);
        let rows = match self.store.scan_report_jobs().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "listing report jobs failed");
                return summary;
            }
        };

        for row in rows {
            let job = match row {
                Ok(job) => job,
                Err(err) => {
                    summary.unreadable += 1;
                    warn!(error = %err, "skipping unreadable report job");
                    continue;
                }
            };
            if !job.enabled {
                continue;
            }
            summary.evaluated += 1;
            let Some(slot) = self.policy.open_slot(&job, now) else {
                continue;
            };
            if let Some(id) = job.id {
                // Another tick may still be working on this slot.
                match self
                    .store
                    .claim_report_slot(id, now.with_timezone(&Utc), slot.with_timezone(&Utc))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(job_id = id, job = %job.name, "slot already claimed");
                        continue;
                    }
                    Err(err) => {
                        error!(job_id = id, error = %err, "claiming report slot failed");
                        continue;
                    }
                }
            }
            summary.outcomes.push(self.run_job(&job, now).await);
        }

        if !summary.outcomes.is_empty() {
            info!(
                evaluated = summary.evaluated,
                fired = summary.outcomes.len(),
                failed = summary.failed(),
                "due report run finished"
            );
        }
        summary
    }

    /// Runs one job immediately, ignoring its schedule.
    pub async fn run_job_now(&self, id: i64, now: DateTime<FixedOffset>) -> Result<JobOutcome> {
        let job = self
            .store
            .get_report_job(id)
            .await
            .with_context(|| format!("loading report job {id}"))?
            .ok_or_else(|| anyhow!("report job {id} not found"))?;
        Ok(self.run_job(&job, now).await)
    }

    pub async fn send_test_email(&self, recipient: &str) -> Result<()> {
        let now = self.clock.now();
        let html = render_report(
            "Media monitor test",
            &period_label(Frequency::Daily, now),
            &[],
            &[],
        )?;
        self.delivery
            .send(recipient, &report_subject("test"), &html)
            .await
            .context("sending test email")
    }

    async fn run_job(&self, job: &ReportJob, now: DateTime<FixedOffset>) -> JobOutcome {
        let result = self.assemble_and_send(job, now).await;
        let (status, articles) = match result {
            Ok(count) => {
                info!(job_id = ?job.id, job = %job.name, articles = count, "report sent");
                (RunStatus::Ok, count)
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(job_id = ?job.id, job = %job.name, error = %message, "report job failed");
                (RunStatus::Error(message), 0)
            }
        };

        if let Some(id) = job.id {
            if let Err(err) = self
                .store
                .update_report_status(id, now.with_timezone(&Utc), &status.to_string())
                .await
            {
                error!(job_id = id, error = %err, "recording report status failed");
            }
        }

        JobOutcome {
            job_id: job.id,
            job_name: job.name.clone(),
            status,
            articles,
        }
    }

    async fn assemble_and_send(&self, job: &ReportJob, now: DateTime<FixedOffset>) -> Result<usize> {
        let searches = self.resolve_searches(&job.search_ids).await?;
        let articles = self.aggregate(&searches).await?;
        let label = period_label(job.frequency, now);
        let html = render_report(&job.name, &label, &searches, &articles)?;
        self.delivery
            .send(&job.recipient, &report_subject(&job.name), &html)
            .await
            .context("delivering report")?;
        Ok(articles.len())
    }

    /// Saved searches in the job's order; ids that no longer exist are dropped.
    pub async fn resolve_searches(&self, ids: &SearchIds) -> Result<Vec<SavedSearch>> {
        let all = self
            .store
            .list_searches()
            .await
            .context("listing saved searches")?;
        Ok(ids
            .as_slice()
            .iter()
            .filter_map(|id| {
                let found = all.iter().find(|s| s.id == Some(*id)).cloned();
                if found.is_none() {
                    debug!(search_id = id, "saved search no longer exists");
                }
                found
            })
            .collect())
    }

    /// Union of every search's results, one entry per dedup key, newest first.
    pub async fn aggregate(&self, searches: &[SavedSearch]) -> Result<Vec<Article>> {
        let mut seen = HashSet::new();
        let mut articles = Vec::new();
        for saved in searches {
            for article in self.search.run_saved(saved, true).await? {
                if seen.insert(article.dedup_key()) {
                    articles.push(article);
                }
            }
        }
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(articles)
    }

    /// Cron job calling [`run_due_reports`](Self::run_due_reports) with the clock's time.
    pub async fn build_ticker(self: Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let scheduler = Arc::clone(&self);
            Box::pin(async move {
                let now = scheduler.clock.now();
                let summary = scheduler.run_due_reports(now).await;
                debug!(evaluated = summary.evaluated, fired = summary.outcomes.len(), "tick");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use medmon_adapters::StaticFeedTransport;
    use medmon_core::SourceConfig;

    use super::*;
    use crate::delivery::DeliveryError;
    use crate::testing::*;
    use crate::{FixedClock, SourceRegistry};

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, ss)
            .unwrap()
    }

    fn eight() -> SendTime {
        SendTime::new(8, 0).unwrap()
    }

    #[test]
    fn daily_fires_for_any_second_of_the_minute() {
        for second in [0, 1, 30, 59] {
            assert!(is_due(Frequency::Daily, eight(), at(2026, 6, 9, 8, 0, second)));
        }
        assert!(!is_due(Frequency::Daily, eight(), at(2026, 6, 9, 8, 1, 0)));
        assert!(!is_due(Frequency::Daily, eight(), at(2026, 6, 9, 7, 59, 59)));
    }

    #[test]
    fn weekly_fires_only_on_monday() {
        assert!(!is_due(Frequency::Weekly, eight(), at(2026, 6, 9, 8, 0, 0)));
        assert!(is_due(Frequency::Weekly, eight(), at(2026, 6, 8, 8, 0, 0)));
    }

    #[test]
    fn monthly_fires_only_on_the_first() {
        assert!(is_due(Frequency::Monthly, eight(), at(2026, 7, 1, 8, 0, 0)));
        assert!(!is_due(Frequency::Monthly, eight(), at(2026, 7, 2, 8, 0, 0)));
    }

    #[test]
    fn period_labels_look_back_by_frequency() {
        let now = utc(2026, 6, 8, 8, 0).fixed_offset();
        assert_eq!(period_label(Frequency::Daily, now), "2026-06-07 to 2026-06-08");
        assert_eq!(period_label(Frequency::Weekly, now), "2026-06-01 to 2026-06-08");
        assert_eq!(period_label(Frequency::Monthly, now), "2026-05-09 to 2026-06-08");
        assert_eq!(report_subject("Desk"), "Media report: Desk");
    }

    fn job(name: &str, frequency: Frequency, send_time: SendTime) -> ReportJob {
        ReportJob {
            id: None,
            name: name.to_string(),
            search_ids: SearchIds::default(),
            frequency,
            send_time,
            recipient: format!("{}@example.org", name.to_lowercase().replace(' ', "-")),
            enabled: true,
            last_run_at: None,
            last_status: None,
        }
    }

    fn local(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        at(y, m, d, hh, mm, 0)
            .and_local_timezone(offset)
            .single()
            .unwrap()
    }

    #[test]
    fn catch_up_window_covers_missed_ticks() {
        let policy = DuePolicy::with_catch_up_minutes(10);
        let daily = job("Desk", Frequency::Daily, eight());

        assert!(!policy.is_due(&daily, local(2026, 6, 9, 7, 59)));
        assert!(policy.is_due(&daily, local(2026, 6, 9, 8, 0)));
        assert!(policy.is_due(&daily, local(2026, 6, 9, 8, 9)));
        assert!(!policy.is_due(&daily, local(2026, 6, 9, 8, 10)));

        assert!(!DuePolicy::exact().is_due(&daily, local(2026, 6, 9, 8, 3)));
        assert!(DuePolicy::exact().is_due(&daily, local(2026, 6, 9, 8, 0)));
    }

    #[test]
    fn last_run_closes_the_slot() {
        let policy = DuePolicy::with_catch_up_minutes(10);
        let mut daily = job("Desk", Frequency::Daily, eight());

        // 06:00 UTC is 08:00 at +02:00.
        daily.last_run_at = Some(utc(2026, 6, 9, 6, 0));
        assert!(!policy.is_due(&daily, local(2026, 6, 9, 8, 0)));
        assert!(!policy.is_due(&daily, local(2026, 6, 9, 8, 5)));

        daily.last_run_at = Some(utc(2026, 6, 8, 6, 0));
        assert!(policy.is_due(&daily, local(2026, 6, 9, 8, 5)));
    }

    #[test]
    fn slot_before_midnight_stays_open_into_next_day() {
        let policy = DuePolicy::with_catch_up_minutes(10);
        let late = job("Late", Frequency::Daily, SendTime::new(23, 55).unwrap());
        assert!(policy.is_due(&late, local(2026, 6, 10, 0, 2)));
        assert!(!policy.is_due(&late, local(2026, 6, 10, 0, 6)));

        let weekly = job("Weekly", Frequency::Weekly, SendTime::new(23, 58).unwrap());
        // Monday's slot reaches into Tuesday; Tuesday's own slot never passes the gate.
        assert!(policy.is_due(&weekly, local(2026, 6, 9, 0, 3)));
        assert!(!policy.is_due(&weekly, local(2026, 6, 10, 0, 3)));
    }

    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(String, String, String)>>,
        pause: std::time::Duration,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn send(&self, recipient: &str, subject: &str, html_body: &str) -> Result<(), DeliveryError> {
            tokio::time::sleep(self.pause).await;
            if recipient.starts_with("fail") {
                return Err(DeliveryError::Transport("smtp down".to_string()));
            }
            self.sent.lock().unwrap().push((
                recipient.to_string(),
                subject.to_string(),
                html_body.to_string(),
            ));
            Ok(())
        }
    }

    const FEED_URL: &str = "https://coast.test/rss";

    fn coast_feed() -> StaticFeedTransport {
        StaticFeedTransport::new().with_body(
            FEED_URL,
            rss(&[
                ("Salmon lice outbreak", "https://coast.test/1", "Mon, 08 Jun 2026 06:00:00 GMT"),
                ("Salmon prices", "https://coast.test/2", "Mon, 08 Jun 2026 07:00:00 GMT"),
                ("Lice treatment", "https://coast.test/3", "Mon, 08 Jun 2026 05:00:00 GMT"),
            ]),
        )
    }

    async fn scheduler_for(
        store: &Store,
        now: DateTime<Utc>,
        delivery: Arc<RecordingDelivery>,
        policy: DuePolicy,
    ) -> ReportScheduler {
        SourceRegistry::new(store.clone())
            .save(&[SourceConfig::new("Coast", FEED_URL, true)])
            .await
            .unwrap();
        let clock = Arc::new(FixedClock::utc(now));
        let search = SearchEngine::new(store.clone(), fetcher(store, coast_feed(), now), clock.clone());
        ReportScheduler::new(store.clone(), search, delivery, clock, policy)
    }

    async fn save_search(store: &Store, name: &str, include: &str) -> i64 {
        store
            .save_search(&SavedSearch {
                id: None,
                name: name.to_string(),
                include_terms: include.to_string(),
                exclude_terms: String::new(),
                date_from: None,
                date_to: None,
                last_x_days: Some(1),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn aggregation_reports_shared_articles_once_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let now = utc(2026, 6, 8, 8, 0);
        let scheduler = scheduler_for(&store, now, Arc::default(), DuePolicy::exact()).await;
        let salmon = save_search(&store, "Salmon", "salmon").await;
        let lice = save_search(&store, "Lice", "lice").await;

        let searches = scheduler
            .resolve_searches(&SearchIds::new([salmon, 404, lice]))
            .await
            .unwrap();
        assert_eq!(searches.len(), 2);
        assert_eq!(searches[0].name, "Salmon");

        let articles = scheduler.aggregate(&searches).await.unwrap();
        let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Salmon prices", "Salmon lice outbreak", "Lice treatment"]);
    }

    #[tokio::test]
    async fn one_failing_job_does_not_block_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let now = utc(2026, 6, 8, 8, 0) + Duration::seconds(30);
        let delivery = Arc::new(RecordingDelivery::default());
        let scheduler = scheduler_for(&store, now, delivery.clone(), DuePolicy::exact()).await;
        let salmon = save_search(&store, "Salmon", "salmon").await;

        let mut desk = job("Desk", Frequency::Daily, eight());
        desk.search_ids = SearchIds::new([salmon, 999]);
        let desk_id = store.save_report_job(&desk).await.unwrap();

        let mut broken = job("Broken", Frequency::Daily, eight());
        broken.recipient = "fail@example.org".into();
        let broken_id = store.save_report_job(&broken).await.unwrap();

        let later_id = store
            .save_report_job(&job("Later", Frequency::Daily, SendTime::new(9, 0).unwrap()))
            .await
            .unwrap();

        let mut off = job("Off", Frequency::Daily, eight());
        off.enabled = false;
        let off_id = store.save_report_job(&off).await.unwrap();

        let summary = scheduler.run_due_reports(now.fixed_offset()).await;
        assert_eq!(summary.evaluated, 3);
        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.failed(), 1);

        let desk = store.get_report_job(desk_id).await.unwrap().unwrap();
        assert_eq!(desk.last_status.as_deref(), Some("OK"));
        assert_eq!(desk.last_run_at, Some(now));

        let broken = store.get_report_job(broken_id).await.unwrap().unwrap();
        let status = broken.last_status.unwrap();
        assert!(status.starts_with("ERROR: "), "{status}");
        assert!(status.contains("smtp down"), "{status}");

        for untouched in [later_id, off_id] {
            let job = store.get_report_job(untouched).await.unwrap().unwrap();
            assert!(job.last_run_at.is_none());
            assert!(job.last_status.is_none());
        }

        let sent = delivery.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "desk@example.org");
        assert_eq!(sent[0].1, "Media report: Desk");
        assert!(sent[0].2.contains("Salmon prices"));
        assert!(!sent[0].2.contains("Lice treatment"));

        let again = scheduler.run_due_reports(now.fixed_offset()).await;
        assert!(again.outcomes.is_empty());
    }

    #[tokio::test]
    async fn overlapping_ticks_send_one_report_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let now = utc(2026, 6, 8, 8, 0);
        let delivery = Arc::new(RecordingDelivery {
            pause: std::time::Duration::from_millis(300),
            ..Default::default()
        });
        let scheduler =
            scheduler_for(&store, now, delivery.clone(), DuePolicy::with_catch_up_minutes(10)).await;
        let salmon = save_search(&store, "Salmon", "salmon").await;
        let mut desk = job("Desk", Frequency::Daily, eight());
        desk.search_ids = SearchIds::new([salmon]);
        let id = store.save_report_job(&desk).await.unwrap();

        let first = scheduler.run_due_reports(now.fixed_offset());
        let second = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            scheduler
                .run_due_reports((now + Duration::minutes(1)).fixed_offset())
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.outcomes.len() + second.outcomes.len(), 1);
        assert_eq!(delivery.sent.lock().unwrap().len(), 1);
        let stored = store.get_report_job(id).await.unwrap().unwrap();
        assert_eq!(stored.last_status.as_deref(), Some("OK"));

        let later = scheduler
            .run_due_reports((now + Duration::minutes(5)).fixed_offset())
            .await;
        assert!(later.outcomes.is_empty());
    }

    #[tokio::test]
    async fn run_job_now_ignores_schedule_and_records_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let now = utc(2026, 6, 9, 14, 17);
        let delivery = Arc::new(RecordingDelivery::default());
        let scheduler = scheduler_for(&store, now, delivery.clone(), DuePolicy::exact()).await;
        let id = store
            .save_report_job(&job("Weekly", Frequency::Weekly, eight()))
            .await
            .unwrap();

        let outcome = scheduler.run_job_now(id, now.fixed_offset()).await.unwrap();
        assert!(outcome.status.is_ok());
        assert_eq!(outcome.articles, 0);
        assert!(delivery.sent.lock().unwrap()[0].2.contains("No matches."));
        assert!(scheduler.run_job_now(4242, now.fixed_offset()).await.is_err());
    }
}
