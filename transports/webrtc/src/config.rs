//! Configuration types for the fan-out engine

use serde::{Deserialize, Serialize};

/// Default per-sender queue depth (3 seconds of 29.97 fps video)
pub const DEFAULT_QUEUE_CAPACITY: usize = 90;

/// Standard 90 kHz RTP video clock
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// 90 kHz ticks per frame at 29.97 fps
pub const DEFAULT_TICK: u32 = 3003;

/// Dynamic payload type used for H.264
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// Constrained-baseline H.264, non-interleaved packetization
pub const DEFAULT_H264_FMTP: &str =
    "profile-level-id=42c01f;packetization-mode=1;level-asymmetry-allowed=1";

/// Main configuration for the fan-out engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// STUN/TURN server URLs (default: none, host candidates only)
    pub ice_servers: Vec<String>,

    /// Gather TCP ICE candidates (default: false)
    pub enable_ice_tcp: bool,

    /// Multiplex every session over one UDP socket (default: true)
    pub enable_udp_mux: bool,

    /// Port of the shared UDP socket; 0 picks an ephemeral port
    pub udp_mux_port: u16,

    /// Maximum frames buffered per (viewer, track) sender before the oldest is evicted
    pub queue_capacity: usize,

    /// Clock rate applied to tracks registered without an explicit one
    pub default_clock_rate: u32,

    /// Per-frame timestamp increment used when a frame carries no pts
    pub default_tick: u32,

    /// RTP payload type for H.264
    pub payload_type: u8,

    /// SDP fmtp line advertised for H.264
    pub h264_fmtp: String,

    /// RTP packet size limit used by the packetizer
    pub mtu: usize,

    /// Where SPS/PPS units are cached for key-frame repair
    pub parameter_set_scope: ParameterSetScope,

    /// Viewer id used for signaling messages that carry no `to`/`from` field
    pub legacy_viewer_id: Option<String>,

    /// Hold back a fresh sender's first frames until a key frame arrives
    pub gate_on_keyframe: bool,
}

/// Scope of the SPS/PPS cache used to repair key frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSetScope {
    /// One cache per registered track (no cross-track leakage)
    PerTrack,
    /// One cache shared by every track
    Shared,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            enable_ice_tcp: false,
            enable_udp_mux: true,
            udp_mux_port: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_clock_rate: DEFAULT_CLOCK_RATE,
            default_tick: DEFAULT_TICK,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            h264_fmtp: DEFAULT_H264_FMTP.to_string(),
            mtu: 1200,
            parameter_set_scope: ParameterSetScope::PerTrack,
            legacy_viewer_id: None,
            gate_on_keyframe: false,
        }
    }
}

impl FanoutConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `queue_capacity` is 0
    /// - `default_clock_rate` or `default_tick` is 0
    /// - `payload_type` is outside the dynamic range 96-127
    /// - `mtu` is below 200 bytes
    /// - an ICE server URL has an unknown scheme
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.default_clock_rate == 0 {
            return Err(Error::InvalidConfig(
                "default_clock_rate must be greater than 0".to_string(),
            ));
        }

        if self.default_tick == 0 {
            return Err(Error::InvalidConfig(
                "default_tick must be greater than 0".to_string(),
            ));
        }

        if !(96..=127).contains(&self.payload_type) {
            return Err(Error::InvalidConfig(format!(
                "payload_type must be in dynamic range 96-127, got {}",
                self.payload_type
            )));
        }

        if self.mtu < 200 {
            return Err(Error::InvalidConfig(format!(
                "mtu must be at least 200 bytes, got {}",
                self.mtu
            )));
        }

        for url in &self.ice_servers {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known {
                return Err(Error::InvalidConfig(format!(
                    "ice server must be a stun:/turn: URL, got {}",
                    url
                )));
            }
        }

        Ok(())
    }

    /// Parse a JSON configuration and validate it
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::Error::InvalidConfig(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Preset for a deployment with exactly one viewer and no signaling addressing
    ///
    /// Unaddressed messages map to `viewer_id`, and every track shares one
    /// parameter-set cache.
    ///
    /// # Example
    ///
    /// ```
    /// use scopecast_webrtc::config::{FanoutConfig, ParameterSetScope};
    ///
    /// let config = FanoutConfig::single_viewer("monitor");
    /// assert_eq!(config.legacy_viewer_id.as_deref(), Some("monitor"));
    /// assert_eq!(config.parameter_set_scope, ParameterSetScope::Shared);
    /// ```
    pub fn single_viewer(viewer_id: &str) -> Self {
        Self {
            legacy_viewer_id: Some(viewer_id.to_string()),
            parameter_set_scope: ParameterSetScope::Shared,
            ..Default::default()
        }
    }
}
