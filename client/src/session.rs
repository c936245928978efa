use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::sleep};

use crate::player::{PlayerAdapter, PlayerObserver};
use crate::protocol::PlaybackEvent;

/// How long duplicate local triggers are debounced and remote-seek echoes
/// suppressed. Drift within this window is tolerated.
pub const SUPPRESS_WINDOW: Duration = Duration::from_millis(500);

/// Outbound side of the relay channel. Emission is fire-and-forget; a
/// dropped message costs one missed sync update and nothing else.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PlaybackEvent);
}

/// Per-client playback synchronization state machine.
///
/// Sits between the player adapter's notifications and the relay channel,
/// deciding which local actions are genuine user intent (emit) and which
/// incoming events should touch the player (apply). Two flags drive it:
///
/// - `is_seeking`: a local seek is in flight; further seek notifications
///   within the window are the adapter re-reporting the same drag.
/// - `is_syncing_seek`: a seek (local or remote) is being applied; the
///   play/pause notifications it triggers are echoes, not user intent.
///
/// Both are cleared by 500 ms release timers, never left set. All pending
/// timers are cancelled when the session is dropped.
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    player: Arc<dyn PlayerAdapter>,
    sink: Arc<dyn EventSink>,
    flags: Mutex<SyncFlags>,
    timers: Mutex<ReleaseTimers>,
}

#[derive(Default)]
struct SyncFlags {
    is_seeking: bool,
    is_syncing_seek: bool,
}

#[derive(Default)]
struct ReleaseTimers {
    local: Option<JoinHandle<()>>,
    remote: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn new(player: Arc<dyn PlayerAdapter>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                player,
                sink,
                flags: Mutex::new(SyncFlags::default()),
                timers: Mutex::new(ReleaseTimers::default()),
            }),
        }
    }

    /// Playback started, for any reason. Emitted unless it is the echo of a
    /// seek currently being applied.
    pub fn on_local_play(&self) {
        if self.inner.flags.lock().is_syncing_seek {
            return;
        }
        self.inner.sink.emit(PlaybackEvent::Play);
    }

    /// Playback stopped, for any reason. Same echo suppression as play.
    pub fn on_local_pause(&self) {
        if self.inner.flags.lock().is_syncing_seek {
            return;
        }
        self.inner.sink.emit(PlaybackEvent::Pause);
    }

    /// A local seek completed. The adapter may report one user drag several
    /// times; only the first within the window is emitted. Seeking also
    /// triggers pause/play notifications on most players, so the echo flag
    /// goes up for the same window.
    pub fn on_local_seeked(&self) {
        {
            let mut flags = self.inner.flags.lock();
            if flags.is_seeking {
                return;
            }
            flags.is_seeking = true;
            flags.is_syncing_seek = true;
        }

        let current_time = self.inner.player.current_time();
        self.inner.sink.emit(PlaybackEvent::Seek { current_time });
        self.schedule_local_release();
    }

    /// Apply an event received from another client. Guarded so that only
    /// events that change observable player state call into the adapter;
    /// duplicates degrade to no-ops or a redundant re-seek. Adapter failures
    /// are logged and dropped, never retried.
    pub fn on_remote_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Play => {
                if self.inner.player.is_paused() {
                    if let Err(e) = self.inner.player.play() {
                        tracing::warn!("Could not apply remote play: {}", e);
                    }
                }
            }
            PlaybackEvent::Pause => {
                if !self.inner.player.is_paused() {
                    if let Err(e) = self.inner.player.pause() {
                        tracing::warn!("Could not apply remote pause: {}", e);
                    }
                }
            }
            PlaybackEvent::Seek { current_time } => {
                self.inner.flags.lock().is_syncing_seek = true;
                if let Err(e) = self.inner.player.seek(current_time) {
                    tracing::warn!("Could not apply remote seek: {}", e);
                }
                self.schedule_remote_release();
            }
            PlaybackEvent::Unknown => {}
        }
    }

    /// Whether local play/pause notifications are currently being swallowed.
    pub fn suppressing(&self) -> bool {
        self.inner.flags.lock().is_syncing_seek
    }

    fn schedule_local_release(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            sleep(SUPPRESS_WINDOW).await;
            let mut flags = inner.flags.lock();
            flags.is_seeking = false;
            flags.is_syncing_seek = false;
        });
        if let Some(old) = self.inner.timers.lock().local.replace(handle) {
            old.abort();
        }
    }

    fn schedule_remote_release(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            sleep(SUPPRESS_WINDOW).await;
            inner.flags.lock().is_syncing_seek = false;
        });
        if let Some(old) = self.inner.timers.lock().remote.replace(handle) {
            old.abort();
        }
    }
}

impl PlayerObserver for SyncSession {
    fn on_play(&self) {
        self.on_local_play();
    }

    fn on_pause(&self) {
        self.on_local_pause();
    }

    fn on_seeked(&self) {
        self.on_local_seeked();
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let mut timers = self.inner.timers.lock();
        if let Some(handle) = timers.local.take() {
            handle.abort();
        }
        if let Some(handle) = timers.remote.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockPlayer {
        paused: Mutex<bool>,
        time: Mutex<f64>,
        play_calls: Mutex<u32>,
        pause_calls: Mutex<u32>,
        seek_calls: Mutex<Vec<f64>>,
        fail_play: bool,
    }

    impl MockPlayer {
        fn paused_at(paused: bool, time: f64) -> Arc<Self> {
            let player = Self::default();
            *player.paused.lock() = paused;
            *player.time.lock() = time;
            Arc::new(player)
        }
    }

    impl PlayerAdapter for MockPlayer {
        fn play(&self) -> Result<(), String> {
            *self.play_calls.lock() += 1;
            if self.fail_play {
                return Err("autoplay policy rejected play".into());
            }
            *self.paused.lock() = false;
            Ok(())
        }

        fn pause(&self) -> Result<(), String> {
            *self.pause_calls.lock() += 1;
            *self.paused.lock() = true;
            Ok(())
        }

        fn seek(&self, seconds: f64) -> Result<(), String> {
            self.seek_calls.lock().push(seconds);
            *self.time.lock() = seconds;
            Ok(())
        }

        fn is_paused(&self) -> bool {
            *self.paused.lock()
        }

        fn current_time(&self) -> f64 {
            *self.time.lock()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<PlaybackEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: PlaybackEvent) {
            self.events.lock().push(event);
        }
    }

    fn session_with(
        player: Arc<MockPlayer>,
    ) -> (SyncSession, Arc<MockPlayer>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let session = SyncSession::new(player.clone(), sink.clone());
        (session, player, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn local_play_emits_exactly_one_event() {
        let (session, _, sink) = session_with(MockPlayer::paused_at(true, 0.0));
        session.on_local_play();
        assert_eq!(sink.events.lock().as_slice(), &[PlaybackEvent::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn local_play_and_pause_suppressed_while_remote_seek_applies() {
        let (session, _, sink) = session_with(MockPlayer::paused_at(false, 5.0));
        session.on_remote_event(PlaybackEvent::Seek { current_time: 30.0 });

        session.on_local_play();
        session.on_local_pause();
        assert!(sink.events.lock().is_empty());

        sleep(Duration::from_millis(510)).await;
        session.on_local_play();
        assert_eq!(sink.events.lock().as_slice(), &[PlaybackEvent::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_local_seeks_within_window_emit_once() {
        let (session, player, sink) = session_with(MockPlayer::paused_at(false, 12.5));
        session.on_local_seeked();
        session.on_local_seeked();
        session.on_local_seeked();
        assert_eq!(
            sink.events.lock().as_slice(),
            &[PlaybackEvent::Seek { current_time: 12.5 }]
        );

        // After the window a fresh drag emits again
        sleep(Duration::from_millis(510)).await;
        *player.time.lock() = 40.0;
        session.on_local_seeked();
        assert_eq!(sink.events.lock().len(), 2);
        assert_eq!(
            sink.events.lock()[1],
            PlaybackEvent::Seek { current_time: 40.0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remote_seek_applies_exact_time_and_releases_after_window() {
        let (session, player, _) = session_with(MockPlayer::paused_at(false, 1.0));
        session.on_remote_event(PlaybackEvent::Seek { current_time: 73.25 });
        assert_eq!(player.seek_calls.lock().as_slice(), &[73.25]);
        assert!(session.suppressing());

        sleep(Duration::from_millis(490)).await;
        assert!(session.suppressing());
        sleep(Duration::from_millis(20)).await;
        assert!(!session.suppressing());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_play_only_acts_when_paused() {
        let (session, player, _) = session_with(MockPlayer::paused_at(false, 0.0));
        session.on_remote_event(PlaybackEvent::Play);
        assert_eq!(*player.play_calls.lock(), 0);

        *player.paused.lock() = true;
        session.on_remote_event(PlaybackEvent::Play);
        assert_eq!(*player.play_calls.lock(), 1);
        assert!(!player.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_pause_only_acts_when_playing() {
        let (session, player, _) = session_with(MockPlayer::paused_at(true, 0.0));
        session.on_remote_event(PlaybackEvent::Pause);
        assert_eq!(*player.pause_calls.lock(), 0);

        *player.paused.lock() = false;
        session.on_remote_event(PlaybackEvent::Pause);
        assert_eq!(*player.pause_calls.lock(), 1);
        assert!(player.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_remote_seek_is_a_harmless_reseek() {
        let (session, player, _) = session_with(MockPlayer::paused_at(false, 0.0));
        session.on_remote_event(PlaybackEvent::Seek { current_time: 9.0 });
        session.on_remote_event(PlaybackEvent::Seek { current_time: 9.0 });
        assert_eq!(player.seek_calls.lock().as_slice(), &[9.0, 9.0]);
        assert_eq!(player.current_time(), 9.0);

        sleep(Duration::from_millis(510)).await;
        assert!(!session.suppressing());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_event_touches_neither_player_nor_flags() {
        let (session, player, sink) = session_with(MockPlayer::paused_at(true, 0.0));
        session.on_remote_event(PlaybackEvent::Unknown);
        assert_eq!(*player.play_calls.lock(), 0);
        assert_eq!(*player.pause_calls.lock(), 0);
        assert!(player.seek_calls.lock().is_empty());
        assert!(sink.events.lock().is_empty());
        assert!(!session.suppressing());
    }

    #[tokio::test(start_paused = true)]
    async fn loopback_round_trip_converges() {
        let (session, player, sink) = session_with(MockPlayer::paused_at(false, 55.5));
        session.on_local_seeked();

        let emitted = sink.events.lock()[0].clone();
        session.on_remote_event(emitted);
        assert_eq!(player.current_time(), 55.5);

        sleep(Duration::from_millis(1100)).await;
        assert!(!session.suppressing());
        session.on_local_seeked();
        assert_eq!(sink.events.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_remote_play_is_logged_not_fatal() {
        let player = Arc::new(MockPlayer {
            fail_play: true,
            ..MockPlayer::default()
        });
        *player.paused.lock() = true;
        let (session, player, _) = session_with(player);

        session.on_remote_event(PlaybackEvent::Play);
        assert_eq!(*player.play_calls.lock(), 1);

        // The session keeps working afterwards
        *player.paused.lock() = false;
        session.on_remote_event(PlaybackEvent::Pause);
        assert_eq!(*player.pause_calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending_release_timers() {
        let (session, _, _) = session_with(MockPlayer::paused_at(false, 3.0));
        session.on_local_seeked();
        session.on_remote_event(PlaybackEvent::Seek { current_time: 8.0 });
        drop(session);
        // Nothing left to fire; advancing past the window must not panic.
        sleep(Duration::from_millis(600)).await;
    }
}
