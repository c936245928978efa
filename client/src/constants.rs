/// Default gateway address when LOCKSTEP_SERVER is unset.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3005";

/// Relay websocket path on the server.
pub const WS_PATH: &str = "/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
