use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use meetup_proto::methods::DeviceInfo;
use meetup_proto::{MediaKind, RtpEncodingParameters};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the signaling server; room and peer ids are appended as query parameters
    pub url: String,
    /// How long a client request waits for its response
    pub request_timeout_ms: u64,
    /// How long a server request may stay unanswered before it is rejected
    pub server_request_timeout_ms: u64,
    /// How long opening the connection may take
    pub open_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:4443".to_string(),
            request_timeout_ms: 15_000,
            server_request_timeout_ms: 10_000,
            open_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn server_request_timeout(&self) -> Duration {
        Duration::from_millis(self.server_request_timeout_ms)
    }

    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// One simulcast layer of the webcam
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingLayer {
    pub max_bitrate: u32,
    pub scale_resolution_down_by: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Send the webcam as several simulcast layers
    pub webcam_simulcast: bool,
    /// Simulcast layers, lowest first
    pub webcam_encodings: Vec<EncodingLayer>,
    pub opus_stereo: bool,
    pub opus_dtx: bool,
    pub opus_fec: bool,
    /// Start bitrate hint for the video encoder (kbps)
    pub video_start_bitrate: u32,
    /// Device name announced in `join`
    pub device_name: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            webcam_simulcast: true,
            webcam_encodings: vec![
                EncodingLayer {
                    max_bitrate: 100_000,
                    scale_resolution_down_by: 4.0,
                },
                EncodingLayer {
                    max_bitrate: 300_000,
                    scale_resolution_down_by: 2.0,
                },
                EncodingLayer {
                    max_bitrate: 900_000,
                    scale_resolution_down_by: 1.0,
                },
            ],
            opus_stereo: false,
            opus_dtx: true,
            opus_fec: true,
            video_start_bitrate: 1000,
            device_name: "meetup-call".to_string(),
        }
    }
}

impl MediaConfig {
    /// Encodings used when producing `kind`
    #[must_use]
    pub fn encodings_for(&self, kind: MediaKind) -> Vec<RtpEncodingParameters> {
        match kind {
            MediaKind::Audio => vec![RtpEncodingParameters {
                dtx: Some(self.opus_dtx),
                ..Default::default()
            }],
            MediaKind::Video if self.webcam_simulcast && !self.webcam_encodings.is_empty() => self
                .webcam_encodings
                .iter()
                .enumerate()
                .map(|(index, layer)| RtpEncodingParameters {
                    rid: Some(format!("r{index}")),
                    max_bitrate: Some(layer.max_bitrate),
                    scale_resolution_down_by: Some(layer.scale_resolution_down_by),
                    scalability_mode: Some("L1T3".to_string()),
                    ..Default::default()
                })
                .collect(),
            MediaKind::Video => vec![RtpEncodingParameters::default()],
        }
    }

    /// Encoder options handed to the media engine when producing `kind`
    #[must_use]
    pub fn codec_options_for(&self, kind: MediaKind) -> Map<String, Value> {
        let options = match kind {
            MediaKind::Audio => json!({
                "opusStereo": self.opus_stereo,
                "opusDtx": self.opus_dtx,
                "opusFec": self.opus_fec,
            }),
            MediaKind::Video => json!({
                "videoGoogleStartBitrate": self.video_start_bitrate,
            }),
        };
        match options {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            flag: "rust".to_string(),
            name: self.device_name.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl CallConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MEETUP_SIGNALING__URL, MEETUP_MEDIA__OPUS_DTX, ...
        builder = builder.add_source(
            Environment::with_prefix("MEETUP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check values that would only fail later, at connect time
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.signaling.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => errors.push(format!(
                "signaling.url must use ws or wss, got {}",
                url.scheme()
            )),
            Err(e) => errors.push(format!("signaling.url is invalid: {e}")),
        }
        if self.signaling.request_timeout_ms == 0 {
            errors.push("signaling.request_timeout_ms must be positive".to_string());
        }
        if self.signaling.server_request_timeout_ms == 0 {
            errors.push("signaling.server_request_timeout_ms must be positive".to_string());
        }
        if self
            .media
            .webcam_encodings
            .iter()
            .any(|layer| layer.scale_resolution_down_by < 1.0)
        {
            errors.push("media.webcam_encodings scale_resolution_down_by must be >= 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.media.webcam_encodings.len(), 3);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = CallConfig::default();
        config.signaling.url = "http://example.com".to_string();
        config.signaling.request_timeout_ms = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("ws or wss"));
    }

    #[test]
    fn test_simulcast_encodings() {
        let media = MediaConfig::default();
        let encodings = media.encodings_for(MediaKind::Video);

        assert_eq!(encodings.len(), 3);
        assert_eq!(encodings[0].rid.as_deref(), Some("r0"));
        assert_eq!(encodings[2].max_bitrate, Some(900_000));

        let single = MediaConfig {
            webcam_simulcast: false,
            ..MediaConfig::default()
        };
        assert_eq!(single.encodings_for(MediaKind::Video).len(), 1);
    }

    #[test]
    fn test_audio_encoding_carries_dtx() {
        let media = MediaConfig::default();
        let encodings = media.encodings_for(MediaKind::Audio);
        assert_eq!(encodings.len(), 1);
        assert_eq!(encodings[0].dtx, Some(true));

        let options = media.codec_options_for(MediaKind::Audio);
        assert_eq!(options["opusFec"], true);
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let config = CallConfig::from_file("/nonexistent/meetup-call.toml").unwrap();
        assert_eq!(config.signaling.server_request_timeout_ms, 10_000);
    }
}
