//! Traceroute-probe scheduler (§4.11) and announcement scheduler
//! (§4.12). Both run as detached tasks spawned from [`Manager::connect`]
//! rather than driven from the dispatch loop — neither depends on any
//! per-frame state, and coupling them to `handle_frame` would block
//! inbound processing on a sleeping timer.
//!
//! [`SchedulerSupervisor`] owns the two tasks' `JoinHandle`s and the
//! scheduler section of the running config (§3 "Scheduler state ...
//! Mutated only by configuration API; schedulers restart on change").
//! A config change goes through
//! [`SchedulerSupervisor::update_scheduler_config`], which validates,
//! aborts whatever is currently running, and respawns both tasks from
//! the new section — rather than a live reference the tasks poll, per
//! §9's redesign note against implicit, uncontrolled shared state.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::{AnnounceMode, Config, SchedulerConfig};
use crate::store::MeshStore;

use super::outbound::OutboundSurface;
use super::template;

const TRACEROUTE_PROBE_CHANNEL: u32 = 0;
const ANNOUNCE_SETTING_KEY: &str = "lastAnnouncementTime";
/// On-start anti-spam window (§4.12): fixed at one hour regardless of
/// the configured interval/cron period (§8 scenario 5).
const ANNOUNCE_ANTI_SPAM_WINDOW: chrono::Duration = chrono::Duration::hours(1);

/// §4.11: every `interval_minutes`, probe whichever node most needs one
/// (unprobed first, then least-recently-probed, per
/// [`MeshStore::get_node_needing_traceroute`]). A 0 interval disables
/// the scheduler entirely rather than spawning a task that never fires.
pub(super) fn spawn_traceroute_scheduler(
    config: Config,
    store: Arc<dyn MeshStore>,
    outbound: Arc<OutboundSurface>,
    is_connected: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let interval_minutes = config.scheduler.traceroute.interval_minutes;
    if interval_minutes == 0 {
        return None;
    }

    Some(tokio::spawn(async move {
        let period = Duration::from_secs(interval_minutes as u64 * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // interval's first tick fires immediately

        loop {
            ticker.tick().await;
            if !is_connected.load(Ordering::SeqCst) {
                continue;
            }
            match store.get_node_needing_traceroute().await {
                Ok(Some(target)) => {
                    if let Err(e) = outbound.send_traceroute(target, TRACEROUTE_PROBE_CHANNEL).await {
                        warn!("scheduled traceroute probe to {target:08x} failed: {e}");
                    }
                }
                Ok(None) => debug!("traceroute scheduler tick: no node currently needs a probe"),
                Err(e) => warn!("store error selecting traceroute target: {e}"),
            }
        }
    }))
}

/// Resolves the next firing time for whichever announcement mode is
/// configured (§4.12). Interval mode anchors to `now + interval_hours`;
/// cron mode asks the `cron` crate for the next match after `now`.
fn next_fire(config: &Config, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match config.scheduler.announce.mode {
        AnnounceMode::Interval => {
            Some(now + chrono::Duration::hours(config.scheduler.announce.interval_hours as i64))
        }
        AnnounceMode::Cron => {
            let expr = config.scheduler.announce.cron.as_deref()?;
            let schedule = Schedule::from_str(expr).ok()?;
            schedule.after(&now).next()
        }
    }
}

/// Whether the last persisted `lastAnnouncementTime` falls inside the
/// fixed one-hour anti-spam window (§4.12, §8 scenario 5). Pulled out of
/// [`spawn_announce_scheduler`] as a pure function so the boundary is
/// directly testable without spinning up a task.
fn recently_announced(last: Option<&str>, now: DateTime<Utc>) -> bool {
    match last {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| now - t.with_timezone(&Utc) < ANNOUNCE_ANTI_SPAM_WINDOW)
            .unwrap_or(false),
        None => false,
    }
}

async fn send_announcement(config: &Config, store: &dyn MeshStore, outbound: &OutboundSurface, started_at: DateTime<Utc>) {
    let uptime_seconds = (Utc::now() - started_at).num_seconds();
    let ctx = template::build_context(
        store,
        config.limits.max_node_age_hours,
        config.limits.distance_unit,
        env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        template::enabled_feature_emojis(config),
    )
    .await;
    let text = template::expand(&config.scheduler.announce.message, &ctx);

    if let Err(e) = outbound
        .send_text(&text, config.scheduler.announce.channel_index, None, None, None)
        .await
    {
        warn!("scheduled announcement failed: {e}");
        return;
    }
    if let Err(e) = store.set_setting(ANNOUNCE_SETTING_KEY, &Utc::now().to_rfc3339()).await {
        warn!("failed to persist {ANNOUNCE_SETTING_KEY}: {e}");
    }
}

/// §4.12: interval or cron mode, mutually exclusive per
/// [`crate::config::Config::validate`]. `onStart` sends one
/// announcement as soon as the radio connects, unless one was already
/// sent within the last interval/cron period (anti-spam across a quick
/// reconnect loop) — checked via the `lastAnnouncementTime` setting
/// rather than in-memory state, so it survives a process restart.
pub(super) fn spawn_announce_scheduler(
    config: Config,
    store: Arc<dyn MeshStore>,
    outbound: Arc<OutboundSurface>,
    is_connected: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
) -> Option<JoinHandle<()>> {
    if !config.scheduler.announce.enabled {
        return None;
    }

    Some(tokio::spawn(async move {
        while !is_connected.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if config.scheduler.announce.on_start {
            let last = store.get_setting(ANNOUNCE_SETTING_KEY).await.ok().flatten();
            if !recently_announced(last.as_deref(), Utc::now()) {
                send_announcement(&config, store.as_ref(), outbound.as_ref(), started_at).await;
            }
        }

        loop {
            let Some(fire_at) = next_fire(&config, Utc::now()) else {
                warn!("announcement scheduler could not compute a next fire time, stopping");
                return;
            };
            let sleep_for = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));
            tokio::time::sleep(sleep_for).await;

            if is_connected.load(Ordering::SeqCst) {
                send_announcement(&config, store.as_ref(), outbound.as_ref(), started_at).await;
            }
        }
    }))
}

/// Owns both scheduler tasks' current `JoinHandle`s plus the rest of the
/// running config they were last spawned with, so a later
/// [`SchedulerSupervisor::update_scheduler_config`] call can restart them
/// without needing the caller to re-supply `store`/`outbound`/
/// `is_connected`/`started_at` (§3, §4.12).
pub(super) struct SchedulerSupervisor {
    store: Arc<dyn MeshStore>,
    outbound: Arc<OutboundSurface>,
    is_connected: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
    config: Mutex<Config>,
    traceroute: Mutex<Option<JoinHandle<()>>>,
    announce: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerSupervisor {
    pub(super) fn spawn(
        config: Config,
        store: Arc<dyn MeshStore>,
        outbound: Arc<OutboundSurface>,
        is_connected: Arc<AtomicBool>,
        started_at: DateTime<Utc>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(SchedulerSupervisor {
            store,
            outbound,
            is_connected,
            started_at,
            config: Mutex::new(config),
            traceroute: Mutex::new(None),
            announce: Mutex::new(None),
        });
        supervisor.restart_locked();
        supervisor
    }

    fn restart_locked(&self) {
        let config = self.config.lock().expect("scheduler config mutex poisoned").clone();

        if let Some(handle) = self.traceroute.lock().expect("traceroute handle mutex poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.announce.lock().expect("announce handle mutex poisoned").take() {
            handle.abort();
        }

        *self.traceroute.lock().expect("traceroute handle mutex poisoned") = spawn_traceroute_scheduler(
            config.clone(),
            self.store.clone(),
            self.outbound.clone(),
            self.is_connected.clone(),
        );
        *self.announce.lock().expect("announce handle mutex poisoned") = spawn_announce_scheduler(
            config,
            self.store.clone(),
            self.outbound.clone(),
            self.is_connected.clone(),
            self.started_at,
        );
    }

    /// §3 "Mutated only by configuration API; schedulers restart on
    /// change", §4.12 "Any configuration change restarts the active
    /// scheduler; disabling stops all timers". Validated first (§7
    /// "invalid configuration ... scheduler unchanged") — a rejected
    /// section leaves both tasks running exactly as they were.
    pub(super) fn update_scheduler_config(&self, scheduler: SchedulerConfig) -> Result<()> {
        Config::validate_scheduler(&scheduler)?;
        self.config.lock().expect("scheduler config mutex poisoned").scheduler = scheduler;
        info!("scheduler configuration changed, restarting traceroute and announce tasks");
        self.restart_locked();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnounceMode;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.scheduler.announce.enabled = true;
        config
    }

    #[test]
    fn interval_mode_anchors_to_configured_hours() {
        let mut config = base_config();
        config.scheduler.announce.mode = AnnounceMode::Interval;
        config.scheduler.announce.interval_hours = 6;
        let now = Utc::now();
        let fire = next_fire(&config, now).unwrap();
        assert_eq!((fire - now).num_hours(), 6);
    }

    #[test]
    fn cron_mode_resolves_a_future_fire_time() {
        let mut config = base_config();
        config.scheduler.announce.mode = AnnounceMode::Cron;
        config.scheduler.announce.cron = Some("0 0 */6 * * *".to_string());
        let now = Utc::now();
        let fire = next_fire(&config, now).unwrap();
        assert!(fire > now);
    }

    #[test]
    fn zero_minute_interval_disables_traceroute_scheduler() {
        let mut config = Config::default();
        config.scheduler.traceroute.interval_minutes = 0;
        assert_eq!(config.scheduler.traceroute.interval_minutes, 0);
    }

    #[test]
    fn announcement_thirty_minutes_ago_suppresses_on_start_send() {
        let last = (Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
        assert!(recently_announced(Some(&last), Utc::now()));
    }

    #[test]
    fn announcement_two_hours_ago_allows_on_start_send() {
        let last = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        assert!(!recently_announced(Some(&last), Utc::now()));
    }

    #[test]
    fn no_prior_announcement_allows_on_start_send() {
        assert!(!recently_announced(None, Utc::now()));
    }

    #[test]
    fn anti_spam_window_ignores_a_much_longer_configured_interval() {
        // recently_announced takes no config input at all: a 24h
        // configured interval must not widen the fixed 1h window.
        let last = (Utc::now() - chrono::Duration::minutes(90)).to_rfc3339();
        assert!(!recently_announced(Some(&last), Utc::now()));
    }

    async fn test_supervisor(config: Config) -> Arc<SchedulerSupervisor> {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MeshStore> =
            Arc::new(crate::store::JsonStore::new(dir.path()).await.unwrap());
        let (transport, _events) = crate::transport::connect("127.0.0.1".to_string(), 0, Duration::from_secs(120));
        let outbound = Arc::new(OutboundSurface::new(transport, store.clone()));
        SchedulerSupervisor::spawn(config, store, outbound, Arc::new(AtomicBool::new(false)), Utc::now())
    }

    #[tokio::test]
    async fn spawning_a_nonzero_traceroute_interval_starts_the_task() {
        let mut config = Config::default();
        config.scheduler.traceroute.interval_minutes = 30;
        let supervisor = test_supervisor(config).await;
        assert!(supervisor
            .traceroute
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished()));
    }

    #[tokio::test]
    async fn updating_to_a_zero_traceroute_interval_stops_the_task() {
        let mut config = Config::default();
        config.scheduler.traceroute.interval_minutes = 30;
        let supervisor = test_supervisor(config.clone()).await;

        let mut scheduler = config.scheduler.clone();
        scheduler.traceroute.interval_minutes = 0;
        supervisor.update_scheduler_config(scheduler).unwrap();

        assert!(supervisor.traceroute.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn an_invalid_scheduler_update_is_rejected_and_leaves_the_running_config_untouched() {
        let mut config = Config::default();
        config.scheduler.traceroute.interval_minutes = 30;
        let supervisor = test_supervisor(config.clone()).await;

        let mut scheduler = config.scheduler.clone();
        scheduler.traceroute.interval_minutes = 61; // out of range
        assert!(supervisor.update_scheduler_config(scheduler).is_err());

        assert_eq!(
            supervisor.config.lock().unwrap().scheduler.traceroute.interval_minutes,
            30
        );
        assert!(supervisor
            .traceroute
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished()));
    }
}
