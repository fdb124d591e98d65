//! Per-zone state cache and state polling.
//!
//! The tracker remembers the last reported source, sub-source, audio format
//! and power state of every zone. A source change triggers a refresh of the
//! zone's volume, audio/video information and listening mode, and full state
//! polls are rate limited so that several triggers in quick succession cost
//! only one poll.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::command::Command;
use crate::commands::CommandTable;
use crate::error::Result;
use crate::types::{ZoneIdentity, ZoneState, UNKNOWN};

/// Minimum time between two full state polls of one zone
pub const QUERY_WINDOW: Duration = Duration::from_millis(5000);

/// Now-playing attributes cleared when the source changes
const MEDIA_ATTRIBUTES: [&str; 6] = ["artist", "title", "album", "image", "position", "duration"];

/// Where state queries are sent
pub trait CommandSink: Send + Sync {
    fn send_command<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<()>>;
}

/// Receives attribute updates for a zone
pub trait StatePublisher: Send + Sync {
    fn publish(&self, entity_id: &str, attributes: Map<String, Value>);
}

/// Publisher that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn publish(&self, entity_id: &str, attributes: Map<String, Value>) {
        tracing::debug!(entity = entity_id, "State update: {}", serde_json::Value::Object(attributes));
    }
}

/// Everything needed to query and publish one zone
#[derive(Clone)]
pub struct ZoneBinding {
    pub id: ZoneIdentity,
    pub entity_id: String,
    pub sink: Arc<dyn CommandSink>,
    pub publisher: Arc<dyn StatePublisher>,
    /// Pause between consecutive queries
    pub threshold: Duration,
}

/// Zone state cache shared by every zone of every receiver
#[derive(Default)]
pub struct ZoneStateTracker {
    states: Mutex<HashMap<ZoneIdentity, ZoneState>>,
    last_queries: Mutex<HashMap<ZoneIdentity, Instant>>,
}

impl ZoneStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state of a zone; all fields unknown if nothing was reported
    pub fn state(&self, id: &ZoneIdentity) -> ZoneState {
        self.states.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    /// Record the selected input; a change resets the sub-source and refreshes the zone
    pub fn set_source(&self, binding: &ZoneBinding, source: &str) -> bool {
        let changed = self.update(&binding.id, |state| {
            replace(&mut state.source, source).then(|| {
                state.sub_source = UNKNOWN.to_string();
            })
        });
        if changed {
            tracing::info!(zone = %binding.id, "Source changed to {}", source.to_lowercase());
            spawn_refresh(binding);
        }
        changed
    }

    /// Record the selected sub-source; a change refreshes the zone
    pub fn set_sub_source(&self, binding: &ZoneBinding, sub_source: &str) -> bool {
        let changed = self.update(&binding.id, |state| {
            replace(&mut state.sub_source, sub_source).then_some(())
        });
        if changed {
            tracing::info!(
                zone = %binding.id,
                "Sub-source changed to {}",
                sub_source.to_lowercase()
            );
            spawn_refresh(binding);
        }
        changed
    }

    pub fn set_power_state(&self, id: &ZoneIdentity, power_state: &str) -> bool {
        self.update(id, |state| replace(&mut state.power_state, power_state).then_some(()))
    }

    pub fn set_audio_format(&self, id: &ZoneIdentity, audio_format: &str) -> bool {
        self.update(id, |state| replace(&mut state.audio_format, audio_format).then_some(()))
    }

    pub fn clear_zone(&self, id: &ZoneIdentity) {
        self.states.lock().unwrap().remove(id);
        self.last_queries.lock().unwrap().remove(id);
    }

    pub fn clear_all(&self) {
        self.states.lock().unwrap().clear();
        self.last_queries.lock().unwrap().clear();
    }

    /// Whether the zone is outside the poll dedup window
    pub fn should_query(&self, id: &ZoneIdentity) -> bool {
        let last_queries = self.last_queries.lock().unwrap();
        outside_window(last_queries.get(id))
    }

    pub fn record_query(&self, id: &ZoneIdentity) {
        self.last_queries.lock().unwrap().insert(id.clone(), Instant::now());
    }

    pub fn record_queries<'a>(&self, ids: impl IntoIterator<Item = &'a ZoneIdentity>) {
        let now = Instant::now();
        let mut last_queries = self.last_queries.lock().unwrap();
        for id in ids {
            last_queries.insert(id.clone(), now);
        }
    }

    /// Poll the full state of a zone
    ///
    /// Returns `false` without sending anything if the zone was polled less
    /// than [`QUERY_WINDOW`] ago. Query failures are logged and end the poll
    /// early; they are never returned.
    pub async fn query_avr_state(&self, binding: &ZoneBinding) -> bool {
        {
            let mut last_queries = self.last_queries.lock().unwrap();
            if !outside_window(last_queries.get(&binding.id)) {
                tracing::debug!(zone = %binding.id, "Skipping state poll, polled recently");
                return false;
            }
            last_queries.insert(binding.id.clone(), Instant::now());
        }

        tracing::info!(zone = %binding.id, "Polling receiver state");
        let names = binding.id.zone.commands();
        let t = binding.threshold;
        let mut steps = vec![
            (names.power, t),
            (names.selector, t),
            (names.volume, t),
            (names.muting, t),
        ];
        if let Some(listening_mode) = names.listening_mode {
            steps.push((listening_mode, t * 3));
        }
        steps.push(("fp-display", Duration::ZERO));

        if let Err(e) = run_queries(binding, &steps).await {
            tracing::warn!(zone = %binding.id, "State poll failed: {}", e);
        }
        true
    }

    /// Re-read the state that depends on the selected source
    pub async fn refresh_avr_state(binding: &ZoneBinding) {
        if let Err(e) = refresh(binding).await {
            tracing::warn!(zone = %binding.id, "State refresh failed: {}", e);
        }
    }

    fn update<F>(&self, id: &ZoneIdentity, apply: F) -> bool
    where
        F: FnOnce(&mut ZoneState) -> Option<()>,
    {
        let mut states = self.states.lock().unwrap();
        apply(states.entry(id.clone()).or_default()).is_some()
    }
}

/// Store `value` lowercased; true if it differs from the current one
fn replace(field: &mut String, value: &str) -> bool {
    let value = value.to_lowercase();
    if *field == value {
        return false;
    }
    *field = value;
    true
}

fn outside_window(last: Option<&Instant>) -> bool {
    last.map_or(true, |last| last.elapsed() > QUERY_WINDOW)
}

/// Refresh on the current runtime; outside one the refresh is skipped
fn spawn_refresh(binding: &ZoneBinding) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(zone = %binding.id, "No async runtime, skipping refresh");
        return;
    };
    let binding = binding.clone();
    runtime.spawn(async move {
        ZoneStateTracker::refresh_avr_state(&binding).await;
    });
}

async fn refresh(binding: &ZoneBinding) -> Result<()> {
    let names = binding.id.zone.commands();
    let t = binding.threshold;

    run_queries(binding, &[(names.volume, t)]).await?;

    let cleared: Map<String, Value> = MEDIA_ATTRIBUTES
        .iter()
        .map(|name| (name.to_string(), Value::Null))
        .collect();
    binding.publisher.publish(&binding.entity_id, cleared);

    let mut steps = vec![
        ("audio-information", t),
        ("video-information", t),
        (names.selector, t * 3),
    ];
    if let Some(listening_mode) = names.listening_mode {
        steps.push((listening_mode, t));
    }
    steps.push(("fp-display", Duration::ZERO));

    run_queries(binding, &steps).await
}

/// Send each query followed by its pause, skipping commands the zone lacks
async fn run_queries(binding: &ZoneBinding, steps: &[(&str, Duration)]) -> Result<()> {
    let table = CommandTable::global();

    for (name, pause) in steps {
        if !table.has_command(binding.id.zone, name) {
            continue;
        }
        let command = Command::query(*name).in_zone(binding.id.zone);
        binding.sink.send_command(&command).await?;
        if !pause.is_zero() {
            sleep(*pause).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EiscpError;
    use crate::types::Zone;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(Instant, Command)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn commands(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.command.clone())
                .collect()
        }

        fn times(&self) -> Vec<Instant> {
            self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    impl CommandSink for RecordingSink {
        fn send_command<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push((Instant::now(), command.clone()));
                if self.fail {
                    Err(EiscpError::NotConnected)
                } else {
                    Ok(())
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl StatePublisher for RecordingPublisher {
        fn publish(&self, entity_id: &str, attributes: Map<String, Value>) {
            self.published
                .lock()
                .unwrap()
                .push((entity_id.to_string(), attributes));
        }
    }

    fn binding(
        zone: Zone,
        sink: Arc<RecordingSink>,
        publisher: Arc<RecordingPublisher>,
    ) -> ZoneBinding {
        ZoneBinding {
            id: ZoneIdentity::new("TX-NR609", "10.0.0.5", zone),
            entity_id: format!("avr_{}", zone),
            sink,
            publisher,
            threshold: Duration::from_millis(250),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn source_change_is_case_insensitive() {
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Main, sink.clone(), Arc::default());
        let tracker = ZoneStateTracker::new();

        assert!(tracker.set_source(&b, "NET"));
        assert!(!tracker.set_source(&b, "net"));
        sleep(Duration::from_secs(5)).await;

        assert_eq!(tracker.state(&b.id).source, "net");
        // Only the first call refreshed
        assert_eq!(sink.commands().iter().filter(|c| *c == "volume").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn source_change_resets_sub_source() {
        let b = binding(Zone::Main, Arc::default(), Arc::default());
        let tracker = ZoneStateTracker::new();

        tracker.set_source(&b, "net");
        assert!(tracker.set_sub_source(&b, "Spotify"));
        assert_eq!(tracker.state(&b.id).sub_source, "spotify");

        tracker.set_source(&b, "tv");
        assert_eq!(tracker.state(&b.id).sub_source, UNKNOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_runs_cascade_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let b = binding(Zone::Main, sink.clone(), publisher.clone());
        let tracker = ZoneStateTracker::new();

        tracker.set_source(&b, "dvd");
        sleep(Duration::from_secs(5)).await;

        assert_eq!(
            sink.commands(),
            vec![
                "volume",
                "audio-information",
                "video-information",
                "input-selector",
                "listening-mode",
                "fp-display"
            ]
        );

        let times = sink.times();
        assert!(times[4] - times[3] >= Duration::from_millis(750));
        assert!(times[2] - times[1] >= Duration::from_millis(250));

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "avr_main");
        assert_eq!(published[0].1.len(), 6);
        assert!(published[0].1.values().all(Value::is_null));
    }

    #[tokio::test(start_paused = true)]
    async fn zone3_refresh_skips_missing_commands() {
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Zone3, sink.clone(), Arc::default());

        ZoneStateTracker::refresh_avr_state(&b).await;

        assert_eq!(sink.commands(), vec!["volume", "selector"]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_order_and_spacing() {
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Main, sink.clone(), Arc::default());
        let tracker = ZoneStateTracker::new();

        assert!(tracker.query_avr_state(&b).await);

        assert_eq!(
            sink.commands(),
            vec![
                "system-power",
                "input-selector",
                "volume",
                "audio-muting",
                "listening-mode",
                "fp-display"
            ]
        );
        let times = sink.times();
        for pair in times[..5].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
        assert!(times[5] - times[4] >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn zone2_poll_uses_zone_commands() {
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Zone2, sink.clone(), Arc::default());
        let tracker = ZoneStateTracker::new();

        tracker.query_avr_state(&b).await;

        assert_eq!(
            sink.commands(),
            vec!["power", "selector", "volume", "muting", "listening-mode"]
        );
        let sent = sink.sent.lock().unwrap();
        assert!(sent.iter().all(|(_, c)| c.zone == Zone::Zone2 && c.args == "query"));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_deduplicated_within_window() {
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Main, sink.clone(), Arc::default());
        let tracker = ZoneStateTracker::new();

        assert!(tracker.query_avr_state(&b).await);
        assert!(!tracker.query_avr_state(&b).await);
        assert_eq!(sink.commands().len(), 6);

        sleep(QUERY_WINDOW).await;
        assert!(tracker.query_avr_state(&b).await);
        assert_eq!(sink.commands().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn should_query_window_boundary() {
        let tracker = ZoneStateTracker::new();
        let id = ZoneIdentity::new("TX-NR609", "10.0.0.5", Zone::Main);
        let other = ZoneIdentity::new("TX-NR609", "10.0.0.5", Zone::Zone2);

        assert!(tracker.should_query(&id));
        tracker.record_queries([&id, &other]);
        assert!(!tracker.should_query(&id));

        sleep(Duration::from_millis(4999)).await;
        assert!(!tracker.should_query(&other));

        sleep(Duration::from_millis(2)).await;
        assert!(tracker.should_query(&id));
        assert!(tracker.should_query(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_contained() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let b = binding(Zone::Main, sink.clone(), Arc::default());
        let tracker = ZoneStateTracker::new();
        tracker.set_power_state(&b.id, "on");

        assert!(tracker.query_avr_state(&b).await);
        assert_eq!(sink.commands(), vec!["system-power"]);
        assert_eq!(tracker.state(&b.id).power_state, "on");
    }

    #[test]
    fn setters_report_changes() {
        let tracker = ZoneStateTracker::new();
        let id = ZoneIdentity::new("TX-NR609", "10.0.0.5", Zone::Main);

        assert!(tracker.set_power_state(&id, "ON"));
        assert!(!tracker.set_power_state(&id, "on"));
        assert!(tracker.set_audio_format(&id, "PCM"));
        assert_eq!(tracker.state(&id).audio_format, "pcm");

        tracker.clear_zone(&id);
        assert_eq!(tracker.state(&id), ZoneState::default());
    }

    #[test]
    fn source_change_outside_runtime_skips_refresh() {
        let tracker = ZoneStateTracker::new();
        let sink = Arc::new(RecordingSink::default());
        let b = binding(Zone::Main, sink.clone(), Arc::new(RecordingPublisher::default()));

        assert!(tracker.set_source(&b, "NET"));
        assert!(tracker.set_sub_source(&b, "spotify"));

        let state = tracker.state(&b.id);
        assert_eq!(state.source, "net");
        assert_eq!(state.sub_source, "spotify");
        assert!(sink.commands().is_empty());
    }
}
