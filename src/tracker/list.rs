//! Grouped tracker bookkeeping.
//!
//! Trackers sit in an ordered list partitioned into groups (tiers): every
//! tracker in group `g` is tried before any tracker in group `g+1`, and a
//! success promotes its tracker to the front of its group so the working
//! one is asked first next cycle. The list only keeps state; the
//! orchestrator dispatches the actual announces and feeds results back
//! through `receive_*`.
//!
//! All times are seconds on the orchestrator's monotonic clock, passed in
//! by the caller so tests can drive the schedule.

use rand::seq::SliceRandom;

use super::error::TrackerError;
use super::response::{AddressList, TrackerEvent};
use crate::constants::{
    SCRAPE_MIN_INTERVAL_SECS, TRACKER_BACKOFF_BASE_SECS, TRACKER_BACKOFF_CAP_SECS,
    TRACKER_DEFAULT_INTERVAL_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Http,
    Udp,
    Dht,
}

/// One tracker's scheduling record.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub url: String,
    pub group: u32,
    pub kind: TrackerKind,
    pub enabled: bool,
    /// Inserted by the user on top of the metainfo's list.
    pub extra: bool,
    pub latest_event: TrackerEvent,

    busy: bool,
    busy_scrape: bool,

    pub failed_counter: u32,
    pub failed_time_last: u64,
    pub success_counter: u32,
    pub success_time_last: u64,
    pub scrape_counter: u32,
    pub scrape_time_last: u64,

    pub latest_sum_peers: usize,
    pub latest_new_peers: usize,

    /// Announce interval granted by the tracker.
    pub normal_interval: u64,
    pub scrape_complete: u32,
    pub scrape_incomplete: u32,
}

impl Tracker {
    fn new(url: String, group: u32, kind: TrackerKind, extra: bool) -> Self {
        Self {
            url,
            group,
            kind,
            enabled: true,
            extra,
            latest_event: TrackerEvent::None,
            busy: false,
            busy_scrape: false,
            failed_counter: 0,
            failed_time_last: 0,
            success_counter: 0,
            success_time_last: 0,
            scrape_counter: 0,
            scrape_time_last: 0,
            latest_sum_peers: 0,
            latest_new_peers: 0,
            normal_interval: TRACKER_DEFAULT_INTERVAL_SECS,
            scrape_complete: 0,
            scrape_incomplete: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_busy_not_scrape(&self) -> bool {
        self.busy && !self.busy_scrape
    }

    pub fn is_usable(&self) -> bool {
        self.enabled
    }

    pub fn is_scrapable(&self) -> bool {
        // The DHT adapter generally cannot scrape; HTTP and UDP can.
        self.kind != TrackerKind::Dht
    }

    pub fn can_request_state(&self) -> bool {
        self.is_usable() && !self.busy
    }

    /// Earliest time the next retry is due after failures.
    pub fn failed_time_next(&self) -> u64 {
        let backoff = TRACKER_BACKOFF_BASE_SECS
            .saturating_mul(1u64 << self.failed_counter.min(12))
            .min(TRACKER_BACKOFF_CAP_SECS);
        self.failed_time_last + backoff
    }

    /// When the next regular announce is due; a tracker never asked is due
    /// immediately.
    pub fn success_time_next(&self) -> u64 {
        if self.success_counter == 0 {
            0
        } else {
            self.success_time_last + self.normal_interval
        }
    }

    /// When this tracker should next be asked, considering its state.
    pub fn request_time_next(&self) -> u64 {
        if self.failed_counter != 0 {
            self.failed_time_next()
        } else {
            self.success_time_next()
        }
    }

    pub fn clear_stats(&mut self) {
        self.failed_counter = 0;
        self.failed_time_last = 0;
        self.success_counter = 0;
        self.success_time_last = 0;
        self.scrape_counter = 0;
        self.scrape_time_last = 0;
        self.latest_sum_peers = 0;
        self.latest_new_peers = 0;
    }
}

/// What to do with an event send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventVerdict {
    /// Dispatch the announce; when `close_scrape` the in-flight scrape is
    /// aborted first.
    Dispatch { close_scrape: bool },
    /// Busy with a non-scrape request; leave it alone.
    Busy,
    /// Disabled tracker; nothing to do.
    Unusable,
}

#[derive(Default)]
pub struct TrackerList {
    trackers: Vec<Tracker>,
}

impl TrackerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tracker> {
        self.trackers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Tracker> {
        self.trackers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter()
    }

    /// Adds a URL to a group, picking the worker kind from the scheme.
    /// Unknown schemes fail for user-supplied trackers and are skipped
    /// with a warning otherwise.
    pub fn insert(
        &mut self,
        group: u32,
        url: &str,
        extra: bool,
    ) -> Result<Option<usize>, TrackerError> {
        let kind = if url.starts_with("http://") || url.starts_with("https://") {
            TrackerKind::Http
        } else if url.starts_with("udp://") {
            TrackerKind::Udp
        } else if url.starts_with("dht://") {
            TrackerKind::Dht
        } else {
            tracing::warn!(url, "no matching tracker protocol");
            if extra {
                return Err(TrackerError::UnsupportedProtocol(url.to_string()));
            }
            return Ok(None);
        };

        let index = self.end_group(group);
        self.trackers
            .insert(index, Tracker::new(url.to_string(), group, kind, extra));

        tracing::debug!(group, url, "added tracker");
        Ok(Some(index))
    }

    pub fn find_url(&self, url: &str) -> Option<usize> {
        self.trackers.iter().position(|t| t.url == url)
    }

    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy)
    }

    pub fn has_active_not_scrape(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy_not_scrape)
    }

    pub fn has_active_in_group(&self, group: u32) -> bool {
        self.group_slice(group).iter().any(Tracker::is_busy)
    }

    pub fn count_active(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_busy()).count()
    }

    pub fn has_usable(&self) -> bool {
        self.trackers.iter().any(Tracker::is_usable)
    }

    pub fn count_usable(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_usable()).count()
    }

    pub fn find_usable(&self, from: usize) -> Option<usize> {
        (from..self.trackers.len()).find(|&i| self.trackers[i].is_usable())
    }

    /// Picks the tracker to ask next, starting at `from`.
    ///
    /// The first requestable tracker is preferred outright when it has no
    /// failures. Otherwise the scan continues: failed trackers compete on
    /// the earliest retry time, and the first unfailed tracker wins if its
    /// regular announce is due before the preferred one's retry.
    pub fn find_next_to_request(&self, from: usize) -> Option<usize> {
        let mut preferred = (from..self.trackers.len())
            .find(|&i| self.trackers[i].can_request_state())?;

        if self.trackers[preferred].failed_counter == 0 {
            return Some(preferred);
        }

        for index in preferred + 1..self.trackers.len() {
            let tracker = &self.trackers[index];
            if !tracker.can_request_state() {
                continue;
            }

            if tracker.failed_counter != 0 {
                if tracker.failed_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = index;
                }
            } else {
                if tracker.success_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = index;
                }
                break;
            }
        }

        Some(preferred)
    }

    /// Index of the first tracker in `group` (or where it would start).
    pub fn begin_group(&self, group: u32) -> usize {
        self.trackers
            .iter()
            .position(|t| group <= t.group)
            .unwrap_or(self.trackers.len())
    }

    /// Index one past the last tracker in `group`.
    pub fn end_group(&self, group: u32) -> usize {
        self.trackers
            .iter()
            .position(|t| t.group > group)
            .unwrap_or(self.trackers.len())
    }

    /// Number of groups; groups are dense from 0 when built from metainfo.
    pub fn size_group(&self) -> u32 {
        self.trackers.last().map_or(0, |t| t.group + 1)
    }

    /// Rotates the group left by one (round-robin).
    pub fn cycle_group(&mut self, group: u32) {
        let begin = self.begin_group(group);
        let end = self.end_group(group);
        if begin < end {
            self.trackers[begin..end].rotate_left(1);
        }
    }

    /// Moves the tracker to the front of its group and returns its new
    /// index. Promoting the group head is the identity.
    pub fn promote(&mut self, index: usize) -> usize {
        let group = self.trackers[index].group;
        let first = self.begin_group(group);
        self.trackers.swap(first, index);
        first
    }

    /// Shuffles each group once, breaking metainfo ordering bias.
    pub fn randomize_group_entries(&mut self) {
        let mut rng = rand::rng();
        let mut begin = 0;
        while begin < self.trackers.len() {
            let group = self.trackers[begin].group;
            let end = self.end_group(group);
            self.trackers[begin..end].shuffle(&mut rng);
            begin = end;
        }
    }

    /// Gate for sending a state event to a tracker.
    pub fn send_event(&mut self, index: usize, event: TrackerEvent) -> EventVerdict {
        let tracker = &mut self.trackers[index];

        if !tracker.is_usable() {
            return EventVerdict::Unusable;
        }
        if tracker.busy {
            if !tracker.busy_scrape {
                return EventVerdict::Busy;
            }
            // An event outranks a scrape in flight.
            tracker.busy_scrape = false;
            tracker.latest_event = event;
            tracing::debug!(url = %tracker.url, "closing scrape for event");
            return EventVerdict::Dispatch { close_scrape: true };
        }

        tracker.latest_event = event;
        tracker.busy = true;
        tracing::debug!(url = %tracker.url, group = tracker.group, event = event.as_str(), "sending event");
        EventVerdict::Dispatch { close_scrape: false }
    }

    /// Whether a scrape may be dispatched now: not busy, scrapable, and
    /// outside the suppression window.
    pub fn can_scrape(&self, index: usize, now: u64) -> bool {
        let tracker = &self.trackers[index];
        tracker.is_usable()
            && !tracker.busy
            && tracker.is_scrapable()
            && tracker.scrape_time_last + SCRAPE_MIN_INTERVAL_SECS <= now
    }

    pub fn mark_scraping(&mut self, index: usize) {
        let tracker = &mut self.trackers[index];
        tracker.busy = true;
        tracker.busy_scrape = true;
        tracing::debug!(url = %tracker.url, group = tracker.group, "sending scrape");
    }

    /// Clears the busy flag without recording an outcome (close/disown).
    pub fn mark_idle(&mut self, index: usize) {
        let tracker = &mut self.trackers[index];
        tracker.busy = false;
        tracker.busy_scrape = false;
    }

    /// Books a successful announce: the tracker is promoted to its group
    /// front and its schedule reset. Returns the tracker's new index.
    pub fn receive_success(
        &mut self,
        index: usize,
        peers: &mut AddressList,
        interval: Option<u32>,
        now: u64,
    ) -> usize {
        peers.normalize();

        let tracker = &mut self.trackers[index];
        tracker.busy = false;
        tracker.busy_scrape = false;
        tracker.success_time_last = now;
        tracker.success_counter += 1;
        tracker.failed_counter = 0;
        tracker.latest_sum_peers = peers.len();
        if let Some(interval) = interval {
            tracker.normal_interval = u64::from(interval).max(60);
        }

        tracing::debug!(url = %self.trackers[index].url, peers = peers.len(), "announce succeeded");
        self.promote(index)
    }

    /// Stores the orchestrator's count of previously unknown peers.
    pub fn set_latest_new_peers(&mut self, index: usize, new_peers: usize) {
        if let Some(tracker) = self.trackers.get_mut(index) {
            tracker.latest_new_peers = new_peers;
        }
    }

    /// Books a failed announce and starts (or extends) the backoff.
    pub fn receive_failed(&mut self, index: usize, msg: &str, now: u64) {
        let tracker = &mut self.trackers[index];
        tracker.busy = false;
        tracker.busy_scrape = false;
        tracker.failed_time_last = now;
        tracker.failed_counter += 1;

        tracing::debug!(url = %tracker.url, msg, failures = tracker.failed_counter, "announce failed");
    }

    pub fn receive_scrape_success(
        &mut self,
        index: usize,
        complete: u32,
        incomplete: u32,
        now: u64,
    ) {
        let tracker = &mut self.trackers[index];
        tracker.busy = false;
        tracker.busy_scrape = false;
        tracker.scrape_time_last = now;
        tracker.scrape_counter += 1;
        tracker.scrape_complete = complete;
        tracker.scrape_incomplete = incomplete;

        tracing::debug!(url = %tracker.url, complete, incomplete, "scrape succeeded");
    }

    pub fn receive_scrape_failed(&mut self, index: usize, msg: &str) {
        let tracker = &mut self.trackers[index];
        tracker.busy = false;
        tracker.busy_scrape = false;

        tracing::debug!(url = %tracker.url, msg, "scrape failed");
    }

    pub fn clear_stats(&mut self) {
        for tracker in &mut self.trackers {
            tracker.clear_stats();
        }
    }

    fn group_slice(&self, group: u32) -> &[Tracker] {
        let begin = self.begin_group(group);
        let end = self.end_group(group);
        &self.trackers[begin..end]
    }
}
