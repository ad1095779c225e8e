//! Configuration (spec §6). A plain struct with framework-constant
//! defaults, built with `Config::default()` plus setters — mirroring the
//! teacher's own `server::Config`/`Default` pair rather than a bean-style
//! binding framework (which spec §1 keeps as an external collaborator).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub client_name: String,

    pub coordinator_connect_string: String,
    pub coordinator_session_timeout_ms: u64,

    /// Queue-deadline horizon for submitted requests.
    pub request_timeout_ms: u64,
    /// Service-deadline horizon; `<= 0` disables it.
    pub response_generation_timeout_ms: i64,

    pub request_thread_core_pool_size: usize,
    pub request_thread_max_pool_size: usize,
    pub request_thread_keep_alive_sec: u64,
    pub thread_pool_queue_size: usize,

    pub request_statistics_window_ms: u64,

    /// If true, handlers receive a zero-copy view of the wire payload; if
    /// false, a defensive copy is made before the handler runs.
    pub avoid_payload_copy: bool,

    /// `0` disables the pre-close drain sleep on user-initiated shutdown.
    pub shutdown_pause_multiplier: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "partition-rpc".to_string(),
            client_name: "partition-rpc-client".to_string(),
            coordinator_connect_string: String::new(),
            coordinator_session_timeout_ms: 30_000,
            request_timeout_ms: 5_000,
            response_generation_timeout_ms: -1,
            request_thread_core_pool_size: 8,
            request_thread_max_pool_size: 32,
            request_thread_keep_alive_sec: 60,
            thread_pool_queue_size: 1_000,
            request_statistics_window_ms: 60_000,
            avoid_payload_copy: false,
            shutdown_pause_multiplier: 0,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when the service deadline is disabled (`<= 0`).
    pub fn response_generation_timeout(&self) -> Option<Duration> {
        if self.response_generation_timeout_ms > 0 {
            Some(Duration::from_millis(self.response_generation_timeout_ms as u64))
        } else {
            None
        }
    }

    pub fn coordinator_session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_session_timeout_ms)
    }

    pub fn shutdown_pause(&self) -> Duration {
        self.coordinator_session_timeout() * self.shutdown_pause_multiplier
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    pub fn with_response_generation_timeout_ms(mut self, ms: i64) -> Self {
        self.response_generation_timeout_ms = ms;
        self
    }

    pub fn with_core_pool_size(mut self, n: usize) -> Self {
        self.request_thread_core_pool_size = n;
        self
    }

    pub fn with_max_pool_size(mut self, n: usize) -> Self {
        self.request_thread_max_pool_size = n;
        self
    }

    pub fn with_queue_size(mut self, n: usize) -> Self {
        self.thread_pool_queue_size = n;
        self
    }

    pub fn with_shutdown_pause_multiplier(mut self, n: u32) -> Self {
        self.shutdown_pause_multiplier = n;
        self
    }
}
