//! Whether notifications are paused right now, by a manual directive or a daily schedule.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::task::AbortOnDropHandle;

use crate::{
    config::Preferences,
    services::external::SharedPreferences,
    utils::{Callback, ResultExt as _, WatchRx, WatchTx, lock_mutex},
    view::ViewManager,
    window::WindowManager,
};

/// Windows receive the new [`PauseNotificationsInfo`] (or null) on this channel.
pub const PAUSE_INFO_CHANNEL: &str = "should-pause-notifications-changed";
pub const PAUSE_NOTIFICATIONS_KEY: &str = "pauseNotifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    Scheduled,
    NonScheduled,
}

/// The occurrence of the daily window that contains the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseNotificationsInfo {
    pub reason: PauseReason,
    pub til_date: DateTime<Utc>,
    pub schedule: Option<Schedule>,
}

/// Manual override stored in the `pauseNotifications` preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDirective {
    Pause(DateTime<Utc>),
    Resume(DateTime<Utc>),
}
impl PauseDirective {
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, at) = raw.split_once(':')?;
        let at = match DateTime::parse_from_rfc3339(at) {
            Ok(at) => at.to_utc(),
            Err(err) => {
                log::warn!("Ignoring malformed pause directive {raw:?}: {err}");
                return None;
            }
        };
        match kind {
            "pause" => Some(Self::Pause(at)),
            "resume" => Some(Self::Resume(at)),
            _ => {
                log::warn!("Ignoring unknown pause directive {raw:?}");
                None
            }
        }
    }

    pub fn until(&self) -> DateTime<Utc> {
        match *self {
            Self::Pause(at) | Self::Resume(at) => at,
        }
    }
}
impl std::fmt::Display for PauseDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause(at) => write!(f, "pause:{}", at.to_rfc3339()),
            Self::Resume(at) => write!(f, "resume:{}", at.to_rfc3339()),
        }
    }
}

fn schedule_times(prefs: &Preferences) -> Option<(NaiveTime, NaiveTime)> {
    let parse = |raw: &str| {
        NaiveTime::parse_from_str(raw, "%H:%M")
            .inspect_err(|err| log::warn!("Bad schedule time {raw:?}: {err}"))
            .ok()
    };
    Some((
        parse(&prefs.pause_notifications_by_schedule_from)?,
        parse(&prefs.pause_notifications_by_schedule_to)?,
    ))
}

fn at_local<Tz: TimeZone>(now: &DateTime<Tz>, day: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    now.timezone()
        .from_local_datetime(&day.and_time(time))
        .earliest()
        .map(|it| it.to_utc())
}

/// The schedule occurrence `now` falls into. Windows are half-open, `[from, to)`, and wrap
/// past midnight when `from > to`.
pub fn current_schedule<Tz: TimeZone>(now: &DateTime<Tz>, prefs: &Preferences) -> Option<Schedule> {
    if !prefs.pause_notifications_by_schedule {
        return None;
    }
    let (from, to) = schedule_times(prefs)?;
    let today = now.date_naive();
    let time = now.time();
    let (from_day, to_day) = if from < to {
        if !(from <= time && time < to) {
            return None;
        }
        (today, today)
    } else if from > to {
        if time >= from {
            (today, today.succ_opt()?)
        } else if time < to {
            (today.pred_opt()?, today)
        } else {
            return None;
        }
    } else {
        return None;
    };
    Some(Schedule {
        from: at_local(now, from_day, from)?,
        to: at_local(now, to_day, to)?,
    })
}

/// `None` means notifications are not paused.
pub fn calc_pause_info<Tz: TimeZone>(
    now: &DateTime<Tz>,
    prefs: &Preferences,
) -> Option<PauseNotificationsInfo> {
    let schedule = current_schedule(now, prefs);
    let now_utc = now.to_utc();
    match prefs
        .pause_notifications
        .as_deref()
        .and_then(PauseDirective::parse)
    {
        Some(PauseDirective::Resume(until)) if now_utc < until => return None,
        Some(PauseDirective::Pause(until)) if now_utc < until => {
            return Some(PauseNotificationsInfo {
                reason: PauseReason::NonScheduled,
                til_date: until,
                schedule,
            });
        }
        _ => {}
    }
    schedule.map(|schedule| PauseNotificationsInfo {
        reason: PauseReason::Scheduled,
        til_date: schedule.to,
        schedule: Some(schedule),
    })
}

/// Every future instant at which [`calc_pause_info`] may change its answer.
pub fn next_boundaries<Tz: TimeZone>(now: &DateTime<Tz>, prefs: &Preferences) -> Vec<DateTime<Utc>> {
    let now_utc = now.to_utc();
    let mut out = Vec::new();
    if let Some(directive) = prefs
        .pause_notifications
        .as_deref()
        .and_then(PauseDirective::parse)
        && directive.until() > now_utc
    {
        out.push(directive.until());
    }
    if prefs.pause_notifications_by_schedule
        && let Some((from, to)) = schedule_times(prefs)
    {
        let today = now.date_naive();
        for time in [from, to] {
            let next = [Some(today), today.succ_opt()]
                .into_iter()
                .flatten()
                .filter_map(|day| at_local(now, day, time))
                .find(|at| *at > now_utc);
            out.extend(next);
        }
    }
    out.sort();
    out.dedup();
    out
}

pub type Clock = Callback<(), DateTime<FixedOffset>>;

pub fn system_clock() -> Clock {
    Callback::from_fn(|()| chrono::Local::now().fixed_offset())
}

pub struct NotificationScheduler {
    this: Weak<Self>,
    preferences: SharedPreferences,
    windows: Arc<WindowManager>,
    views: Arc<ViewManager>,
    clock: Clock,
    info: WatchTx<Option<PauseNotificationsInfo>>,
    updating: AtomicBool,
    timers: Mutex<Vec<AbortOnDropHandle<()>>>,
    _on_prefs: AbortOnDropHandle<()>,
}

impl NotificationScheduler {
    /// Recomputes whenever preferences change. Must be called inside the runtime.
    pub fn new(
        preferences: SharedPreferences,
        windows: Arc<WindowManager>,
        views: Arc<ViewManager>,
        clock: Clock,
    ) -> Arc<Self> {
        let prefs_rx = preferences.subscribe();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            preferences,
            windows,
            views,
            clock,
            info: WatchTx::new(None),
            updating: AtomicBool::new(false),
            timers: Mutex::default(),
            _on_prefs: AbortOnDropHandle::new(tokio::spawn(run_on_prefs(this.clone(), prefs_rx))),
        })
    }

    pub fn get_pause_info(&self) -> Option<PauseNotificationsInfo> {
        self.info.borrow().clone()
    }

    pub fn subscribe(&self) -> WatchRx<Option<PauseNotificationsInfo>> {
        self.info.subscribe()
    }

    /// Recomputes, publishes the result to windows and views, and re-arms the boundary timers.
    pub fn update(&self) -> Option<PauseNotificationsInfo> {
        if self.updating.swap(true, Ordering::AcqRel) {
            log::debug!("Pause info update already running");
            return self.get_pause_info();
        }
        let now = self.clock.call(());
        let prefs = self.preferences.get_all();
        let info = calc_pause_info(&now, &prefs);

        let paused = info.is_some();
        self.views
            .apply_notification_prefs(paused && prefs.pause_notifications_mute_audio, paused);
        if let Some(payload) = serde_json::to_value(&info).ok_or_log() {
            self.windows.send_to_all_windows(PAUSE_INFO_CHANNEL, &payload);
        }
        if self.info.send_replace(info.clone()) != info {
            log::info!("Notifications paused: {info:?}");
        }
        self.arm_timers(&now, &prefs);

        self.updating.store(false, Ordering::Release);
        info
    }

    fn arm_timers(&self, now: &DateTime<FixedOffset>, prefs: &Preferences) {
        let now_utc = now.to_utc();
        let timers = next_boundaries(now, prefs)
            .into_iter()
            .filter_map(|at| (at - now_utc).to_std().ok())
            .map(|delay| {
                let this = self.this.clone();
                AbortOnDropHandle::new(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(this) = this.upgrade() {
                        this.update();
                    }
                }))
            })
            .collect();
        // Dropping the old handles cancels them
        *lock_mutex(&self.timers) = timers;
    }

    pub fn armed_timers(&self) -> usize {
        lock_mutex(&self.timers)
            .iter()
            .filter(|it| !it.is_finished())
            .count()
    }

    /// Stores a manual directive. The preference change triggers the recomputation.
    pub fn set_directive(&self, directive: Option<PauseDirective>) -> anyhow::Result<()> {
        let value = match directive {
            Some(directive) => serde_json::Value::String(directive.to_string()),
            None => serde_json::Value::Null,
        };
        self.preferences.set(PAUSE_NOTIFICATIONS_KEY, value)
    }
}

async fn run_on_prefs(this: Weak<NotificationScheduler>, mut rx: WatchRx<Preferences>) {
    while rx.changed().await.is_ok() {
        let Some(this) = this.upgrade() else {
            break;
        };
        this.update();
    }
}
