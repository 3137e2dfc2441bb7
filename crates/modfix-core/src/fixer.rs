//! Dual-state reconciliation: compares the physical and virtual key states
//! each cycle, tracks per-key mismatches and releases keys whose logical
//! state stayed pressed after the physical release.

use crate::config::Config;
use crate::mapping::KeyMappingTable;
use crate::physical::PhysicalKeyState;
use crate::registry::KeyRegistry;
use crate::types::{EventSink, EventSource, LogicalKeyQuery, RawKeyEvent};
use crate::virtual_keys::VirtualKeyState;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause between injecting corrective releases and re-polling, so the
/// injected events have reached the logical key state.
const FIX_SETTLE: Duration = Duration::from_millis(20);

/// Per-key record of a physical/virtual disagreement: whether one is active
/// and when it began. The onset latches; re-entering an active mismatch does
/// not move it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MismatchTracker {
    since: Option<Instant>,
}

impl MismatchTracker {
    /// Marks the mismatch as active. Idempotent while already active.
    pub fn start(&mut self, now: Instant) {
        if self.since.is_none() {
            self.since = Some(now);
        }
    }

    /// Clears the mismatch unconditionally.
    pub fn reset(&mut self) {
        self.since = None;
    }

    pub fn is_mismatched(&self) -> bool {
        self.since.is_some()
    }

    /// Zero while clear.
    pub fn duration(&self, now: Instant) -> Duration {
        match self.since {
            Some(since) => now.saturating_duration_since(since),
            None => Duration::ZERO,
        }
    }

    /// Inclusive threshold: a mismatch of exactly `threshold` counts.
    pub fn is_stuck(&self, threshold: Duration, now: Instant) -> bool {
        self.is_mismatched() && self.duration(now) >= threshold
    }
}

/// One tracker per registry entry, positionally aligned.
#[derive(Debug, Clone, Default)]
pub struct MismatchTrackers {
    slots: Vec<MismatchTracker>,
}

impl MismatchTrackers {
    pub fn new(registry: &KeyRegistry) -> Self {
        Self {
            slots: vec![MismatchTracker::default(); registry.len()],
        }
    }

    pub fn get(&self, index: usize) -> Option<&MismatchTracker> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MismatchTracker> {
        self.slots.get_mut(index)
    }

    pub fn is_stuck(&self, index: usize, threshold: Duration, now: Instant) -> bool {
        self.slots
            .get(index)
            .is_some_and(|t| t.is_stuck(threshold, now))
    }

    pub fn any_stuck(&self, threshold: Duration, now: Instant) -> bool {
        self.slots.iter().any(|t| t.is_stuck(threshold, now))
    }
}

/// Monotonic per-key fix counters plus a running total.
#[derive(Debug, Clone, Default)]
pub struct FixStatistics {
    fixes: Vec<u64>,
    total: u64,
}

impl FixStatistics {
    pub fn new(registry: &KeyRegistry) -> Self {
        Self {
            fixes: vec![0; registry.len()],
            total: 0,
        }
    }

    pub fn record(&mut self, index: usize) {
        self.total += 1;
        if let Some(count) = self.fixes.get_mut(index) {
            *count += 1;
        }
    }

    pub fn count(&self, index: usize) -> u64 {
        self.fixes.get(index).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.fixes.fill(0);
    }
}

/// Read-only view of one monitored key, for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySnapshot {
    pub id: String,
    pub name: String,
    pub physical: bool,
    pub logical: bool,
    pub mismatched: bool,
    pub mismatch_ms: u64,
    pub stuck: bool,
    pub fixes: u64,
}

/// Point-in-time view of the whole engine. Comparison is positional, which
/// is safe because a snapshot never outlives the configuration it was taken
/// under.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSnapshot {
    pub keys: Vec<KeySnapshot>,
    pub total_fixes: u64,
    pub paused: bool,
    pub threshold_ms: u64,
}

/// The reconciliation engine. Owns the event source and sink exclusively for
/// its lifetime; one cycle (`process_events`) always runs to completion.
pub struct FixEngine {
    registry: KeyRegistry,
    mappings: KeyMappingTable,
    physical: PhysicalKeyState,
    virtual_keys: VirtualKeyState,
    trackers: MismatchTrackers,
    stats: FixStatistics,
    threshold: Duration,
    show_messages: bool,
    paused: bool,
    source: Box<dyn EventSource + Send>,
    sink: Box<dyn EventSink + Send>,
    query: Box<dyn LogicalKeyQuery + Send>,
}

impl FixEngine {
    pub fn new(
        config: &Config,
        source: Box<dyn EventSource + Send>,
        sink: Box<dyn EventSink + Send>,
        query: Box<dyn LogicalKeyQuery + Send>,
    ) -> Self {
        let registry = KeyRegistry::from_config(&config.keys);
        let mappings = KeyMappingTable::build(&config.key_mappings, &registry);
        let physical = PhysicalKeyState::new(&registry);
        let virtual_keys = VirtualKeyState::new(&registry);
        let trackers = MismatchTrackers::new(&registry);
        let stats = FixStatistics::new(&registry);

        Self {
            registry,
            mappings,
            physical,
            virtual_keys,
            trackers,
            stats,
            threshold: config.general.threshold(),
            show_messages: config.general.show_messages,
            paused: false,
            source,
            sink,
            query,
        }
    }

    /// One reconciliation cycle: wait (bounded) for a keystroke, handle it,
    /// then refresh the virtual state and the trackers. Runs the polling
    /// tail even when no event arrived, and even while paused, so mismatch
    /// durations stay live for whoever is watching.
    pub fn process_events(&mut self, timeout: Duration) {
        if let Some(event) = self.source.wait_for_event(timeout) {
            self.handle_event(event);
        }

        self.poll_virtual();
        self.reconcile(Instant::now());
    }

    fn handle_event(&mut self, event: RawKeyEvent) {
        if self.paused {
            self.forward(event);
            return;
        }

        // The fix decision looks at the press set as it was before this
        // event; the event's own state change lands afterwards.
        let now = Instant::now();
        if self.should_fix(event, now) {
            let fixed = self.fix_stuck_keys(now);
            if fixed > 0 && self.show_messages {
                info!(count = fixed, "auto-fix released stuck keys");
            }
        }

        self.physical.process_event(&self.registry, &self.mappings, event);
        self.forward(event);
    }

    /// Fix only on a key-down, only when something is stuck, and never while
    /// the user is physically holding a monitored key (an intentional chord
    /// must not be broken up).
    fn should_fix(&self, event: RawKeyEvent, now: Instant) -> bool {
        if event.up {
            return false;
        }
        if !self.trackers.any_stuck(self.threshold, now) {
            return false;
        }
        !self.physical.any_pressed()
    }

    fn fix_stuck_keys(&mut self, now: Instant) -> usize {
        let stuck: Vec<(usize, RawKeyEvent, String)> = self
            .registry
            .iter()
            .enumerate()
            .filter(|(index, _)| self.trackers.is_stuck(*index, self.threshold, now))
            .map(|(index, entry)| (index, RawKeyEvent::release(entry.key), entry.name.clone()))
            .collect();

        let mut fixed = 0;
        for (index, release, name) in stuck {
            if let Err(err) = self.sink.inject(release) {
                warn!(key = %name, %err, "failed to inject corrective release");
                continue;
            }
            self.stats.record(index);
            fixed += 1;
            if self.show_messages {
                info!(key = %name, "released stuck key");
            }
        }

        if fixed > 0 {
            // Re-poll right away so the trackers see the correction before
            // the next cycle.
            std::thread::sleep(FIX_SETTLE);
            self.poll_virtual();
        }

        fixed
    }

    fn forward(&mut self, event: RawKeyEvent) {
        if let Err(err) = self.sink.inject(event) {
            warn!(%err, "failed to forward key event");
        }
    }

    fn poll_virtual(&mut self) {
        self.virtual_keys.poll(&self.registry, self.query.as_ref());
    }

    /// The only fault mode tracked is "virtual still pressed after the
    /// physical release". The converse is a poll that has not caught up yet
    /// and is never flagged.
    fn reconcile(&mut self, now: Instant) {
        for index in 0..self.registry.len() {
            let mismatch = !self.physical.is_pressed(index) && self.virtual_keys.is_pressed(index);
            if let Some(tracker) = self.trackers.get_mut(index) {
                if mismatch {
                    tracker.start(now);
                } else {
                    tracker.reset();
                }
            }
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!("monitoring paused");
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            debug!("monitoring resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Live-tunable settings only; registry, mappings and counters stay.
    pub fn apply_config(&mut self, config: &Config) {
        self.threshold = config.general.threshold();
        self.show_messages = config.general.show_messages;
    }

    /// Full reload: rebuilds registry, mapping table, both runtime states,
    /// trackers and statistics from the new configuration.
    pub fn reinitialize(&mut self, config: &Config) {
        self.registry = KeyRegistry::from_config(&config.keys);
        self.mappings = KeyMappingTable::build(&config.key_mappings, &self.registry);
        self.physical = PhysicalKeyState::new(&self.registry);
        self.virtual_keys = VirtualKeyState::new(&self.registry);
        self.trackers = MismatchTrackers::new(&self.registry);
        self.stats = FixStatistics::new(&self.registry);
        self.apply_config(config);
        info!(keys = self.registry.len(), "detector reinitialized");
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn physical(&self) -> &PhysicalKeyState {
        &self.physical
    }

    pub fn virtual_keys(&self) -> &VirtualKeyState {
        &self.virtual_keys
    }

    pub fn trackers(&self) -> &MismatchTrackers {
        &self.trackers
    }

    pub fn statistics(&self) -> &FixStatistics {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> EngineSnapshot {
        let keys = self
            .registry
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let tracker = self.trackers.get(index).copied().unwrap_or_default();
                KeySnapshot {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    physical: self.physical.is_pressed(index),
                    logical: self.virtual_keys.is_pressed(index),
                    mismatched: tracker.is_mismatched(),
                    mismatch_ms: tracker.duration(now).as_millis() as u64,
                    stuck: tracker.is_stuck(self.threshold, now),
                    fixes: self.stats.count(index),
                }
            })
            .collect();

        EngineSnapshot {
            keys,
            total_fixes: self.stats.total(),
            paused: self.paused,
            threshold_ms: self.threshold.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SC_LCTRL, SC_RCTRL, SC_RSHIFT, VK_LCONTROL};
    use crate::types::ScKey;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    const KEY_A: ScKey = ScKey::new(0x1E, false);

    /// Idle cycle: the bounded wait times out with no keystroke.
    const IDLE: Option<RawKeyEvent> = None;

    fn dn(key: ScKey) -> Option<RawKeyEvent> {
        Some(RawKeyEvent::down(key))
    }

    fn rel(key: ScKey) -> Option<RawKeyEvent> {
        Some(RawKeyEvent::release(key))
    }

    /// Replays a script one cycle at a time; `None` entries model a wait
    /// that timed out.
    struct ScriptedSource {
        script: VecDeque<Option<RawKeyEvent>>,
    }

    impl EventSource for ScriptedSource {
        fn wait_for_event(&mut self, _timeout: Duration) -> Option<RawKeyEvent> {
            self.script.pop_front().flatten()
        }
    }

    /// Records injected events and, like the real OS, lets an injected
    /// release clear the logical key state.
    struct LoopbackSink {
        injected: Arc<Mutex<Vec<RawKeyEvent>>>,
        logical: Arc<Mutex<HashSet<u16>>>,
        vk_by_key: HashMap<ScKey, u16>,
    }

    impl EventSink for LoopbackSink {
        fn inject(&mut self, event: RawKeyEvent) -> anyhow::Result<()> {
            self.injected.lock().unwrap().push(event);
            if let Some(vk) = self.vk_by_key.get(&event.key) {
                let mut logical = self.logical.lock().unwrap();
                if event.up {
                    logical.remove(vk);
                } else {
                    logical.insert(*vk);
                }
            }
            Ok(())
        }
    }

    struct SharedQuery {
        logical: Arc<Mutex<HashSet<u16>>>,
    }

    impl LogicalKeyQuery for SharedQuery {
        fn is_logically_pressed(&self, vk: u16) -> bool {
            self.logical.lock().unwrap().contains(&vk)
        }
    }

    struct Harness {
        engine: FixEngine,
        injected: Arc<Mutex<Vec<RawKeyEvent>>>,
        logical: Arc<Mutex<HashSet<u16>>>,
    }

    impl Harness {
        fn new(config: &Config, script: Vec<Option<RawKeyEvent>>) -> Self {
            let injected = Arc::new(Mutex::new(Vec::new()));
            let logical = Arc::new(Mutex::new(HashSet::new()));

            let registry = KeyRegistry::from_config(&config.keys);
            let vk_by_key = registry.iter().map(|e| (e.key, e.vk)).collect();

            let engine = FixEngine::new(
                config,
                Box::new(ScriptedSource {
                    script: script.into(),
                }),
                Box::new(LoopbackSink {
                    injected: injected.clone(),
                    logical: logical.clone(),
                    vk_by_key,
                }),
                Box::new(SharedQuery {
                    logical: logical.clone(),
                }),
            );

            Self {
                engine,
                injected,
                logical,
            }
        }

        fn stick(&self, vk: u16) {
            self.logical.lock().unwrap().insert(vk);
        }

        fn injected(&self) -> Vec<RawKeyEvent> {
            self.injected.lock().unwrap().clone()
        }

        fn cycle(&mut self) {
            self.engine.process_events(Duration::ZERO);
        }
    }

    fn instant_config(threshold_ms: u32) -> Config {
        let mut config = Config::default();
        config.general.threshold_ms = threshold_ms;
        config.general.show_messages = false;
        config
    }

    #[test]
    fn tracker_onset_latches() {
        let t0 = Instant::now();
        let mut tracker = MismatchTracker::default();

        tracker.start(t0);
        tracker.start(t0 + Duration::from_millis(500));
        tracker.start(t0 + Duration::from_millis(900));

        assert_eq!(
            tracker.duration(t0 + Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn tracker_reset_discards_onset() {
        let t0 = Instant::now();
        let mut tracker = MismatchTracker::default();

        tracker.start(t0);
        tracker.reset();
        assert!(!tracker.is_mismatched());
        assert_eq!(tracker.duration(t0 + Duration::from_secs(5)), Duration::ZERO);

        // A later start begins a fresh interval.
        let t1 = t0 + Duration::from_secs(10);
        tracker.start(t1);
        assert_eq!(
            tracker.duration(t1 + Duration::from_millis(3)),
            Duration::from_millis(3)
        );
    }

    #[test]
    fn stuck_boundary_is_inclusive() {
        let t0 = Instant::now();
        let threshold = Duration::from_millis(1000);
        let mut tracker = MismatchTracker::default();
        tracker.start(t0);

        assert!(!tracker.is_stuck(threshold, t0 + Duration::from_millis(999)));
        assert!(tracker.is_stuck(threshold, t0 + Duration::from_millis(1000)));
        assert!(tracker.is_stuck(threshold, t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn clear_tracker_is_never_stuck() {
        let tracker = MismatchTracker::default();
        assert!(!tracker.is_stuck(Duration::ZERO, Instant::now()));
    }

    #[test]
    fn idle_cycle_still_polls_and_tracks() {
        let mut h = Harness::new(&instant_config(1000), vec![]);
        h.stick(VK_LCONTROL);

        h.cycle();

        let index = h.engine.registry().index_of_id("lctrl").unwrap();
        assert!(h.engine.trackers().get(index).unwrap().is_mismatched());
        assert!(h.injected().is_empty());
    }

    #[test]
    fn fix_releases_stuck_key_and_forwards_trigger() {
        let mut h = Harness::new(
            &instant_config(0),
            vec![dn(KEY_A), dn(SC_RCTRL)],
        );
        h.stick(VK_LCONTROL);

        // First cycle: the A press arrives before anything is mismatched, so
        // it only forwards; the trailing poll then latches the mismatch.
        h.cycle();
        assert_eq!(h.injected(), vec![RawKeyEvent::down(KEY_A)]);

        // Second cycle: threshold 0 makes the mismatch immediately stuck;
        // the rctrl press triggers the fix against the pre-event press set.
        h.cycle();
        assert_eq!(
            h.injected(),
            vec![
                RawKeyEvent::down(KEY_A),
                RawKeyEvent::release(SC_LCTRL),
                RawKeyEvent::down(SC_RCTRL),
            ]
        );

        let registry = h.engine.registry();
        let lctrl = registry.index_of_id("lctrl").unwrap();
        let rctrl = registry.index_of_id("rctrl").unwrap();
        assert_eq!(h.engine.statistics().count(lctrl), 1);
        assert_eq!(h.engine.statistics().total(), 1);
        // The trigger's own press landed after the fix decision.
        assert!(h.engine.physical().is_pressed(rctrl));
        // The forced re-poll saw the release, so the tracker is clear again.
        assert!(!h.engine.trackers().get(lctrl).unwrap().is_mismatched());
    }

    #[test]
    fn fix_suppressed_while_a_monitored_key_is_held() {
        let mut h = Harness::new(
            &instant_config(30),
            vec![dn(SC_RSHIFT), dn(KEY_A), rel(SC_RSHIFT), dn(KEY_A)],
        );
        h.stick(VK_LCONTROL);

        h.cycle(); // rshift down: mismatch not stuck yet, press lands
        std::thread::sleep(Duration::from_millis(40));

        h.cycle(); // A down: stuck, but rshift is held, so no fix
        let lctrl = h.engine.registry().index_of_id("lctrl").unwrap();
        assert_eq!(h.engine.statistics().total(), 0);
        assert!(h.engine.trackers().get(lctrl).unwrap().is_mismatched());

        h.cycle(); // rshift up: key-up events never trigger
        assert_eq!(h.engine.statistics().total(), 0);

        h.cycle(); // A down again: chord gone, fix fires
        assert_eq!(h.engine.statistics().total(), 1);
        assert!(h
            .injected()
            .contains(&RawKeyEvent::release(SC_LCTRL)));
    }

    #[test]
    fn paused_engine_forwards_untouched_but_keeps_tracking() {
        let mut h = Harness::new(&instant_config(0), vec![dn(SC_RSHIFT), dn(KEY_A)]);
        h.stick(VK_LCONTROL);
        h.engine.pause();
        assert!(h.engine.is_paused());

        h.cycle();
        h.cycle();

        // Both events passed through unmodified, no release was injected.
        assert_eq!(
            h.injected(),
            vec![RawKeyEvent::down(SC_RSHIFT), RawKeyEvent::down(KEY_A)]
        );
        assert_eq!(h.engine.statistics().total(), 0);

        // Physical state is not mutated while paused.
        let rshift = h.engine.registry().index_of_id("rshift").unwrap();
        assert!(!h.engine.physical().is_pressed(rshift));

        // Polling continued: the mismatch is live for the display.
        let lctrl = h.engine.registry().index_of_id("lctrl").unwrap();
        assert!(h.engine.trackers().get(lctrl).unwrap().is_mismatched());

        // Resume, and the next key-down fixes it.
        h.engine.resume();
        assert!(!h.engine.is_paused());
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let mut h = Harness::new(&instant_config(1000), vec![]);
        h.engine.pause();
        h.engine.pause();
        assert!(h.engine.is_paused());
        h.engine.resume();
        h.engine.resume();
        assert!(!h.engine.is_paused());
    }

    #[test]
    fn statistics_accumulate_per_key_and_total() {
        let mut h = Harness::new(
            &instant_config(0),
            vec![IDLE, dn(KEY_A), IDLE, dn(KEY_A), IDLE, dn(KEY_A)],
        );

        // Three separate stick/fix rounds against the same key. Each round
        // needs an idle cycle to latch the mismatch before the key-down that
        // triggers the fix; the loopback sink clears the logical state when
        // the corrective release is injected.
        for _ in 0..3 {
            h.stick(VK_LCONTROL);
            h.cycle();
            h.cycle();
        }

        let registry = h.engine.registry();
        let lctrl = registry.index_of_id("lctrl").unwrap();
        assert_eq!(h.engine.statistics().total(), 3);
        assert_eq!(h.engine.statistics().count(lctrl), 3);
        for id in ["rctrl", "lshift", "rshift", "lalt", "ralt", "lwin", "rwin"] {
            let index = registry.index_of_id(id).unwrap();
            assert_eq!(h.engine.statistics().count(index), 0, "key {id}");
        }
    }

    #[test]
    fn multiple_stuck_keys_release_in_registry_order() {
        let mut h = Harness::new(&instant_config(0), vec![IDLE, dn(KEY_A)]);
        h.stick(VK_LCONTROL);
        h.stick(crate::registry::VK_RMENU);

        h.cycle();
        h.cycle();

        assert_eq!(
            h.injected(),
            vec![
                RawKeyEvent::release(SC_LCTRL),
                RawKeyEvent::release(crate::registry::SC_RALT),
                RawKeyEvent::down(KEY_A),
            ]
        );
        assert_eq!(h.engine.statistics().total(), 2);
    }

    #[test]
    fn apply_config_is_a_live_tune_not_a_reset() {
        let mut h = Harness::new(&instant_config(1000), vec![]);
        let before_len = h.engine.registry().len();

        let mut update = instant_config(250);
        update.keys.monitor_win = false; // ignored by apply_config
        h.engine.apply_config(&update);

        assert_eq!(h.engine.threshold(), Duration::from_millis(250));
        assert_eq!(h.engine.registry().len(), before_len);
    }

    #[test]
    fn reinitialize_rebuilds_registry_and_counters() {
        let mut h = Harness::new(&instant_config(0), vec![IDLE, dn(KEY_A)]);
        h.stick(VK_LCONTROL);
        h.cycle();
        h.cycle();
        assert_eq!(h.engine.statistics().total(), 1);

        let mut update = instant_config(500);
        update.keys.monitor_win = false;
        h.engine.reinitialize(&update);

        assert_eq!(h.engine.registry().len(), 6);
        assert_eq!(h.engine.statistics().total(), 0);
        assert_eq!(h.engine.threshold(), Duration::from_millis(500));
        assert!(!h.engine.physical().any_pressed());
    }

    #[test]
    fn snapshot_reports_mismatch_and_statistics() {
        let mut h = Harness::new(&instant_config(1000), vec![]);
        h.stick(VK_LCONTROL);
        h.cycle();

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.threshold_ms, 1000);
        assert!(!snapshot.paused);
        let lctrl = snapshot.keys.iter().find(|k| k.id == "lctrl").unwrap();
        assert!(lctrl.logical);
        assert!(!lctrl.physical);
        assert!(lctrl.mismatched);
        assert!(!lctrl.stuck);

        let rwin = snapshot.keys.iter().find(|k| k.id == "rwin").unwrap();
        assert!(!rwin.mismatched);
    }
}
