use libloading::{Library, Symbol};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    env,
    ffi::{c_char, c_int, CStr, CString},
    path::{Path, PathBuf},
    ptr,
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};

/// The state machine's only way to affect or observe actual playback.
/// Implementations must not distinguish why a call happens; suppression of
/// programmatic echoes is the session's job.
pub trait PlayerAdapter: Send + Sync {
    fn play(&self) -> Result<(), String>;
    fn pause(&self) -> Result<(), String>;
    fn seek(&self, seconds: f64) -> Result<(), String>;
    fn is_paused(&self) -> bool;
    fn current_time(&self) -> f64;
}

/// Invoked whenever playback state changes, for any reason: user input,
/// programmatic call, or buffering.
pub trait PlayerObserver: Send + Sync {
    fn on_play(&self);
    fn on_pause(&self);
    fn on_seeked(&self);
}

/// How often the watcher samples the player.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A position discontinuity beyond the expected advance by this much is
/// reported as a seek.
const SEEK_JUMP_SECS: f64 = 1.5;

/// Derives observer notifications from polled player state, since the bound
/// libVLC surface exposes no event callbacks.
pub struct PlayerWatcher;

impl PlayerWatcher {
    pub fn spawn(
        player: Arc<dyn PlayerAdapter>,
        observer: Arc<dyn PlayerObserver>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            let mut last: Option<Sample> = None;

            loop {
                ticker.tick().await;
                let sample = Sample {
                    paused: player.is_paused(),
                    time: player.current_time(),
                    at: Instant::now(),
                };

                if let Some(prev) = last {
                    if sample.paused != prev.paused {
                        if sample.paused {
                            observer.on_pause();
                        } else {
                            observer.on_play();
                        }
                    }

                    let expected = if prev.paused {
                        prev.time
                    } else {
                        prev.time + (sample.at - prev.at).as_secs_f64()
                    };
                    if (sample.time - expected).abs() > SEEK_JUMP_SECS {
                        observer.on_seeked();
                    }
                }
                last = Some(sample);
            }
        })
    }
}

#[derive(Clone, Copy)]
struct Sample {
    paused: bool,
    time: f64,
    at: Instant,
}

/// Wrapper around libVLC for actual playback.
pub struct VlcPlayer {
    instance: *mut libvlc_instance_t,
    media_player: *mut libvlc_media_player_t,
    current_source: Mutex<Option<String>>,
}

unsafe impl Send for VlcPlayer {}
unsafe impl Sync for VlcPlayer {}

impl VlcPlayer {
    pub fn new() -> Result<Self, String> {
        ensure_lib_loaded()?;
        let instance = unsafe { libvlc_new_instance()? };
        let media_player = match unsafe { libvlc_media_player_new(instance) } {
            Ok(player) => player,
            Err(err) => {
                unsafe { libvlc_release(instance) };
                return Err(err);
            }
        };

        Ok(Self {
            instance,
            media_player,
            current_source: Mutex::new(None),
        })
    }

    /// Load a local video file
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| "Invalid path encoding".to_string())?;
        let c_path =
            CString::new(path_str).map_err(|_| "Path contains embedded NUL".to_string())?;

        unsafe {
            let media = libvlc_media_new_path(self.instance, c_path.as_ptr())?;
            libvlc_media_player_set_media(self.media_player, media)?;
            libvlc_media_release(media);
        }

        *self.current_source.lock() = Some(path_str.to_string());
        Ok(())
    }

    /// Load a video served over HTTP (the gateway's media address)
    pub fn load_url(&self, url: &str) -> Result<(), String> {
        let c_url = CString::new(url).map_err(|_| "URL contains embedded NUL".to_string())?;

        unsafe {
            let media = libvlc_media_new_location(self.instance, c_url.as_ptr())?;
            libvlc_media_player_set_media(self.media_player, media)?;
            libvlc_media_release(media);
        }

        *self.current_source.lock() = Some(url.to_string());
        Ok(())
    }

    pub fn current_source(&self) -> Option<String> {
        self.current_source.lock().clone()
    }

    /// Stop playback and discard the loaded media
    pub fn stop(&self) -> Result<(), String> {
        *self.current_source.lock() = None;
        unsafe { libvlc_media_player_stop(self.media_player) }
    }

    /// Get video duration (in seconds)
    pub fn duration(&self) -> Option<f64> {
        let len = unsafe { libvlc_media_player_get_length(self.media_player)? };
        (len > 0).then(|| len as f64 / 1000.0)
    }
}

impl PlayerAdapter for VlcPlayer {
    fn play(&self) -> Result<(), String> {
        unsafe { libvlc_media_player_play(self.media_player) }
    }

    fn pause(&self) -> Result<(), String> {
        unsafe { libvlc_media_player_set_pause(self.media_player, true) }
    }

    fn seek(&self, seconds: f64) -> Result<(), String> {
        unsafe { libvlc_media_player_set_time(self.media_player, (seconds * 1000.0) as i64) }
    }

    fn is_paused(&self) -> bool {
        unsafe { !libvlc_media_player_is_playing(self.media_player) }
    }

    fn current_time(&self) -> f64 {
        unsafe {
            libvlc_media_player_get_time(self.media_player)
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(0.0)
        }
    }
}

impl Drop for VlcPlayer {
    fn drop(&mut self) {
        unsafe {
            let _ = libvlc_media_player_stop(self.media_player);
            libvlc_media_player_release(self.media_player);
            libvlc_release(self.instance);
        }
    }
}

// --- libVLC dynamic bindings -------------------------------------------------

static LIBVLC: OnceCell<&'static Library> = OnceCell::new();

fn ensure_lib_loaded() -> Result<(), String> {
    libvlc_library().map(|_| ())
}

fn libvlc_library() -> Result<&'static Library, String> {
    LIBVLC
        .get_or_try_init(|| {
            let lib = unsafe { load_library()? };
            Ok(Box::leak(Box::new(lib)))
        })
        .map(|lib| *lib)
}

unsafe fn load_library() -> Result<Library, String> {
    if let Ok(path) = env::var("LIBVLC_PATH") {
        return Library::new(&path)
            .map_err(|e| format!("Failed to load libVLC from {}: {e}", path));
    }

    let mut errors = Vec::new();
    for candidate in default_candidates() {
        match Library::new(&candidate) {
            Ok(lib) => return Ok(lib),
            Err(err) => errors.push(format!("{}: {err}", candidate.display())),
        }
    }

    Err(format!(
        "Unable to locate libVLC. Set LIBVLC_PATH or install VLC. Tried:\n{}",
        errors.join("\n")
    ))
}

fn default_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("libvlc.dll"));
        paths.push(PathBuf::from("vlc\\libvlc.dll"));
        if let Some(pf) = env::var_os("ProgramFiles") {
            paths.push(PathBuf::from(pf).join("VideoLAN\\VLC\\libvlc.dll"));
        }
        if let Some(pf86) = env::var_os("ProgramFiles(x86)") {
            paths.push(PathBuf::from(pf86).join("VideoLAN\\VLC\\libvlc.dll"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("libvlc.so"));
        paths.push(PathBuf::from("libvlc.so.5"));
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("libvlc.dylib"));
        paths.push(PathBuf::from(
            "/Applications/VLC.app/Contents/MacOS/lib/libvlc.dylib",
        ));
    }

    paths
}

fn symbol_name(bytes: &[u8]) -> &str {
    std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap_or("<invalid>")
}

unsafe fn get_symbol<T>(name: &'static [u8]) -> Result<Symbol<'static, T>, String> {
    libvlc_library()?
        .get(name)
        .map_err(|e| format!("Failed to load symbol {}: {e}", symbol_name(name)))
}

unsafe fn libvlc_new_instance() -> Result<*mut libvlc_instance_t, String> {
    let sym: Symbol<unsafe extern "C" fn(c_int, *const *const c_char) -> *mut libvlc_instance_t> =
        get_symbol(b"libvlc_new\0")?;
    let ptr = sym(0, ptr::null());
    if ptr.is_null() {
        Err(format_error("libvlc_new"))
    } else {
        Ok(ptr)
    }
}

unsafe fn libvlc_release(instance: *mut libvlc_instance_t) {
    if let Ok(sym) = get_symbol::<unsafe extern "C" fn(*mut libvlc_instance_t)>(b"libvlc_release\0")
    {
        sym(instance);
    }
}

unsafe fn libvlc_media_player_new(
    instance: *mut libvlc_instance_t,
) -> Result<*mut libvlc_media_player_t, String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_instance_t) -> *mut libvlc_media_player_t> =
        get_symbol(b"libvlc_media_player_new\0")?;
    let ptr = sym(instance);
    if ptr.is_null() {
        Err(format_error("libvlc_media_player_new"))
    } else {
        Ok(ptr)
    }
}

unsafe fn libvlc_media_player_release(player: *mut libvlc_media_player_t) {
    if let Ok(sym) = get_symbol::<unsafe extern "C" fn(*mut libvlc_media_player_t)>(
        b"libvlc_media_player_release\0",
    ) {
        sym(player);
    }
}

unsafe fn libvlc_media_new_path(
    instance: *mut libvlc_instance_t,
    path: *const c_char,
) -> Result<*mut libvlc_media_t, String> {
    let sym: Symbol<
        unsafe extern "C" fn(*mut libvlc_instance_t, *const c_char) -> *mut libvlc_media_t,
    > = get_symbol(b"libvlc_media_new_path\0")?;
    let media = sym(instance, path);
    if media.is_null() {
        Err(format_error("libvlc_media_new_path"))
    } else {
        Ok(media)
    }
}

unsafe fn libvlc_media_new_location(
    instance: *mut libvlc_instance_t,
    url: *const c_char,
) -> Result<*mut libvlc_media_t, String> {
    let sym: Symbol<
        unsafe extern "C" fn(*mut libvlc_instance_t, *const c_char) -> *mut libvlc_media_t,
    > = get_symbol(b"libvlc_media_new_location\0")?;
    let media = sym(instance, url);
    if media.is_null() {
        Err(format_error("libvlc_media_new_location"))
    } else {
        Ok(media)
    }
}

unsafe fn libvlc_media_release(media: *mut libvlc_media_t) {
    if let Ok(sym) =
        get_symbol::<unsafe extern "C" fn(*mut libvlc_media_t)>(b"libvlc_media_release\0")
    {
        sym(media);
    }
}

unsafe fn libvlc_media_player_set_media(
    player: *mut libvlc_media_player_t,
    media: *mut libvlc_media_t,
) -> Result<(), String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t, *mut libvlc_media_t)> =
        get_symbol(b"libvlc_media_player_set_media\0")?;
    sym(player, media);
    Ok(())
}

unsafe fn libvlc_media_player_play(player: *mut libvlc_media_player_t) -> Result<(), String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t) -> c_int> =
        get_symbol(b"libvlc_media_player_play\0")?;
    if sym(player) == 0 {
        Ok(())
    } else {
        Err(format_error("Failed to start playback"))
    }
}

unsafe fn libvlc_media_player_set_pause(
    player: *mut libvlc_media_player_t,
    paused: bool,
) -> Result<(), String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t, c_int)> =
        get_symbol(b"libvlc_media_player_set_pause\0")?;
    sym(player, if paused { 1 } else { 0 });
    Ok(())
}

unsafe fn libvlc_media_player_stop(player: *mut libvlc_media_player_t) -> Result<(), String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t)> =
        get_symbol(b"libvlc_media_player_stop\0")?;
    sym(player);
    Ok(())
}

unsafe fn libvlc_media_player_set_time(
    player: *mut libvlc_media_player_t,
    time_ms: i64,
) -> Result<(), String> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t, i64)> =
        get_symbol(b"libvlc_media_player_set_time\0")?;
    sym(player, time_ms);
    Ok(())
}

unsafe fn libvlc_media_player_get_time(player: *mut libvlc_media_player_t) -> Option<i64> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t) -> i64> =
        get_symbol(b"libvlc_media_player_get_time\0").ok()?;
    let value = sym(player);
    if value < 0 {
        None
    } else {
        Some(value)
    }
}

unsafe fn libvlc_media_player_get_length(player: *mut libvlc_media_player_t) -> Option<i64> {
    let sym: Symbol<unsafe extern "C" fn(*mut libvlc_media_player_t) -> i64> =
        get_symbol(b"libvlc_media_player_get_length\0").ok()?;
    Some(sym(player))
}

unsafe fn libvlc_media_player_is_playing(player: *mut libvlc_media_player_t) -> bool {
    let Ok(sym) = get_symbol::<unsafe extern "C" fn(*mut libvlc_media_player_t) -> c_int>(
        b"libvlc_media_player_is_playing\0",
    ) else {
        return false;
    };
    sym(player) != 0
}

fn format_error(action: &str) -> String {
    unsafe {
        if let Ok(sym) = get_symbol::<unsafe extern "C" fn() -> *const c_char>(b"libvlc_errmsg\0") {
            let ptr = sym();
            if !ptr.is_null() {
                let msg = CStr::from_ptr(ptr).to_string_lossy().into_owned();
                if !msg.is_empty() {
                    return format!("{action}: {msg}");
                }
            }
        }
    }
    action.to_string()
}

#[repr(C)]
struct libvlc_instance_t {
    _private: [u8; 0],
}

#[repr(C)]
struct libvlc_media_t {
    _private: [u8; 0],
}

#[repr(C)]
struct libvlc_media_player_t {
    _private: [u8; 0],
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Default)]
    struct FakePlayer {
        paused: Mutex<bool>,
        time: Mutex<f64>,
    }

    impl PlayerAdapter for FakePlayer {
        fn play(&self) -> Result<(), String> {
            *self.paused.lock() = false;
            Ok(())
        }

        fn pause(&self) -> Result<(), String> {
            *self.paused.lock() = true;
            Ok(())
        }

        fn seek(&self, seconds: f64) -> Result<(), String> {
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
    struct RecordingObserver {
        plays: Mutex<u32>,
        pauses: Mutex<u32>,
        seeks: Mutex<u32>,
    }

    impl PlayerObserver for RecordingObserver {
        fn on_play(&self) {
            *self.plays.lock() += 1;
        }

        fn on_pause(&self) {
            *self.pauses.lock() += 1;
        }

        fn on_seeked(&self) {
            *self.seeks.lock() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reports_pause_toggles() {
        let player = Arc::new(FakePlayer::default());
        *player.paused.lock() = true;
        let observer = Arc::new(RecordingObserver::default());
        let handle = PlayerWatcher::spawn(player.clone(), observer.clone());

        sleep(Duration::from_millis(250)).await;
        player.play().unwrap();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(*observer.plays.lock(), 1);

        player.pause().unwrap();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(*observer.pauses.lock(), 1);
        assert_eq!(*observer.seeks.lock(), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reports_position_jumps_as_seeks() {
        let player = Arc::new(FakePlayer::default());
        *player.paused.lock() = true;
        let observer = Arc::new(RecordingObserver::default());
        let handle = PlayerWatcher::spawn(player.clone(), observer.clone());

        sleep(Duration::from_millis(250)).await;
        player.seek(120.0).unwrap();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(*observer.seeks.lock(), 1);

        handle.abort();
    }
}
