//! `PeerTransport` on top of webrtc-rs
//!
//! Media tracks are supplied by the embedding application; this adapter only
//! negotiates, forwards connection-state changes and gathered candidates as
//! [`TransportEvent`]s, and reads round-trip time and available bitrate from
//! the nominated candidate pair.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::StatsReportType;

use crate::config::WebRtcConfig;
use crate::error::{Error, Result};
use crate::transport::{
    IceCandidate, PeerTransport, SdpType, SessionDescription, TransportEvent, TransportEventSender,
    TransportFactory, TransportState, TransportStats,
};
use crate::types::ViewerId;

fn negotiation_error(e: webrtc::Error) -> Error {
    Error::Negotiation(e.to_string())
}

fn transport_error(e: webrtc::Error) -> Error {
    Error::Transport(e.to_string())
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp;
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(Error::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    }
    .map_err(negotiation_error)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Negotiation("unspecified SDP type".to_string()))
        }
    };
    Ok(SessionDescription::new(sdp_type, description.sdp.clone()))
}

/// Builds one `RTCPeerConnection` per viewer leg
pub struct RtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<String>,
    /// Whether offers carry send-only audio/video sections
    offer_media: bool,
}

impl RtcTransportFactory {
    /// Factory for the broadcaster side; offers carry audio and video
    pub fn broadcaster(config: &WebRtcConfig) -> Result<Self> {
        Self::build(config, true)
    }

    /// Factory for the viewer side; answers mirror the offer
    pub fn viewer(config: &WebRtcConfig) -> Result<Self> {
        Self::build(config, false)
    }

    fn build(config: &WebRtcConfig, offer_media: bool) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(transport_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(transport_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            ice_servers: config.ice_servers.clone(),
            offer_media,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        viewer_id: &ViewerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let connection = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(transport_error)?;

        if self.offer_media {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                connection
                    .add_transceiver_from_kind(kind, None)
                    .await
                    .map_err(transport_error)?;
            }
        }

        let state_events = events.clone();
        let state_viewer = viewer_id.clone();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let viewer_id = state_viewer.clone();
            Box::pin(async move {
                debug!(viewer_id = %viewer_id, state = %state, "Peer connection state changed");
                let _ = events.send(TransportEvent::StateChanged {
                    viewer_id,
                    state: state.into(),
                });
            })
        }));

        let candidate_viewer = viewer_id.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let viewer_id = candidate_viewer.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate {
                            viewer_id,
                            candidate: init.into(),
                        });
                    }
                    Err(e) => {
                        warn!(viewer_id = %viewer_id, error = %e, "Failed to serialize local candidate");
                    }
                }
            })
        }));

        Ok(Arc::new(RtcPeerTransport {
            viewer_id: viewer_id.clone(),
            connection: Arc::new(connection),
        }))
    }
}

pub struct RtcPeerTransport {
    viewer_id: ViewerId,
    connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(negotiation_error)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(negotiation_error)
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.connection.get_stats().await;
        let pair = report.reports.values().find_map(|stats| match stats {
            StatsReportType::CandidatePair(pair) if pair.nominated => Some(pair),
            _ => None,
        });
        let Some(pair) = pair else {
            return Err(Error::Transport(format!(
                "no nominated candidate pair for {}",
                self.viewer_id
            )));
        };

        let positive = |value: f64| (value > 0.0).then_some(value);
        Ok(TransportStats {
            rtt_ms: positive(pair.current_round_trip_time).map(|seconds| seconds * 1000.0),
            bitrate_bps: positive(pair.available_outgoing_bitrate).map(|bps| bps as u64),
            jitter_ms: None,
            frame_rate: None,
        })
    }

    async fn close(&self) -> Result<()> {
        self.connection.close().await.map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Failed),
            TransportState::Failed
        );
    }

    #[test]
    fn test_rollback_is_refused() {
        let err = to_rtc(SessionDescription::new(SdpType::Rollback, "")).unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host");
        let init = RTCIceCandidateInit::from(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_legs() {
        let config = WebRtcConfig {
            ice_servers: Vec::new(),
        };
        let broadcaster = RtcTransportFactory::broadcaster(&config).unwrap();
        let viewer = RtcTransportFactory::viewer(&config).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let offerer = broadcaster.create(&ViewerId::from("v1"), tx.clone()).await.unwrap();
        let answerer = viewer.create(&ViewerId::from("v1"), tx).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        offerer.set_local_description(offer.clone()).await.unwrap();

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }
}
