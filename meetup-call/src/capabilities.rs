//! Router capability negotiation

use meetup_proto::methods::GET_ROUTER_RTP_CAPABILITIES;
use meetup_proto::{MediaKind, RtpCapabilities, RtpCodecCapability};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{NegotiationError, Result};
use crate::signaling::SignalingChannel;

/// What both the router and the local engine can handle.
///
/// Codecs keep the router's order, payload types and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityProfile {
    router: RtpCapabilities,
    common: RtpCapabilities,
}

impl CapabilityProfile {
    /// Intersect router and local capabilities
    pub fn from_router(
        router: RtpCapabilities,
        local: &RtpCapabilities,
    ) -> std::result::Result<Self, NegotiationError> {
        let mut codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| local.codecs.iter().any(|ours| ours.matches(codec)))
            .cloned()
            .collect();

        // An RTX entry only stays next to the codec it retransmits
        let kept: Vec<u8> = codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .filter_map(|codec| codec.preferred_payload_type)
            .collect();
        codecs.retain(|codec| {
            !codec.is_rtx()
                || codec
                    .associated_payload_type()
                    .is_some_and(|apt| kept.contains(&apt))
        });

        if !codecs.iter().any(|codec| !codec.is_rtx()) {
            return Err(NegotiationError::Incompatible);
        }

        let header_extensions = router
            .header_extensions
            .iter()
            .filter(|ext| {
                local
                    .header_extensions
                    .iter()
                    .any(|ours| ours.uri == ext.uri && ours.kind == ext.kind)
            })
            .cloned()
            .collect();

        Ok(Self {
            router,
            common: RtpCapabilities {
                codecs,
                header_extensions,
            },
        })
    }

    /// Capabilities announced to the server in `join`
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.common
    }

    #[must_use]
    pub const fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router
    }

    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.preferred_codec(kind).is_some()
    }

    /// First common codec of `kind` in router order
    #[must_use]
    pub fn preferred_codec(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.common
            .codecs
            .iter()
            .find(|codec| codec.kind == kind && !codec.is_rtx())
    }
}

/// Fetches the router's capabilities once per session
pub struct CapabilityNegotiator;

impl CapabilityNegotiator {
    pub async fn load(
        channel: &SignalingChannel,
        local: &RtpCapabilities,
    ) -> Result<CapabilityProfile> {
        let router: RtpCapabilities = channel
            .request(GET_ROUTER_RTP_CAPABILITIES, &json!({}))
            .await?;
        debug!(codecs = router.codecs.len(), "Received router capabilities");

        let profile = CapabilityProfile::from_router(router, local)?;
        info!(
            audio = profile.preferred_codec(MediaKind::Audio).map(|c| c.mime_type.as_str()),
            video = profile.preferred_codec(MediaKind::Video).map(|c| c.mime_type.as_str()),
            "Capabilities negotiated"
        );
        Ok(profile)
    }
}
