//! webrtc-rs implementation of the transport traits
//!
//! One [`RtcSessionFactory`] builds a single webrtc-rs API object (H.264 codec,
//! default interceptors, optional shared UDP mux) and creates one
//! `RTCPeerConnection` per viewer from it. Tracks are `TrackLocalStaticRTP`
//! added as send-only transceivers; frames are packetized here with
//! `H264Payloader` so the caller controls the RTP timestamp of every frame.

use super::{
    DescriptionKind, FrameInfo, LocalCandidate, MediaSession, SessionDescription, SessionEvent,
    SessionEvents, SessionFactory, SessionOptions, SessionState, SignalingState,
    TrackDescriptor, TrackSender,
};
use crate::config::FanoutConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Size of a fixed RTP header without CSRCs or extensions
const RTP_HEADER_LEN: usize = 12;

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
    ]
}

fn h264_capability(clock_rate: u32, fmtp: &str) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate,
        channels: 0,
        sdp_fmtp_line: fmtp.to_owned(),
        rtcp_feedback: video_feedback(),
    }
}

/// Creates webrtc-rs sessions that share one API object
pub struct RtcSessionFactory {
    api: API,
    mtu: usize,
}

impl RtcSessionFactory {
    /// Build the media engine, interceptors and network settings
    ///
    /// Binds the shared UDP socket when UDP multiplexing is enabled.
    pub async fn new(config: &FanoutConfig) -> Result<Self> {
        config.validate()?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: h264_capability(config.default_clock_rate, &config.h264_fmtp),
                    payload_type: config.payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| Error::WebRtcError(format!("Failed to register H.264 codec: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let mut settings = SettingEngine::default();
        if config.enable_udp_mux {
            let socket = tokio::net::UdpSocket::bind(("0.0.0.0", config.udp_mux_port)).await?;
            info!("ICE UDP mux listening on {}", socket.local_addr()?);
            let udp_mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
            settings.set_udp_network(UDPNetwork::Muxed(udp_mux));
            settings.set_network_types(vec![NetworkType::Udp4]);
        } else {
            settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Udp6]);
        }
        if config.enable_ice_tcp {
            warn!("ICE-TCP candidates are not supported by this transport; gathering UDP only");
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .with_setting_engine(settings)
            .build();

        Ok(Self {
            api,
            mtu: config.mtu.saturating_sub(RTP_HEADER_LEN),
        })
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    #[instrument(skip(self, options, events), fields(viewer_id = %options.viewer_id))]
    async fn create_session(
        &self,
        options: &SessionOptions,
        events: SessionEvents,
    ) -> Result<Arc<dyn MediaSession>> {
        let rtc_config = RTCConfiguration {
            ice_servers: options
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let session = Arc::new(RtcSession {
            connection_id: uuid::Uuid::new_v4().to_string(),
            pc,
            state: Arc::new(Mutex::new(SessionState::New)),
            candidates: Arc::new(Mutex::new(CandidateGate::default())),
            events,
            mtu: self.mtu,
        });
        session.wire_callbacks();

        info!(
            "Created session for {} (connection_id={})",
            options.viewer_id, session.connection_id
        );
        Ok(session)
    }
}

/// Holds local candidates back until the local description has been reported
#[derive(Default)]
struct CandidateGate {
    open: bool,
    pending: Vec<LocalCandidate>,
}

/// One viewer's `RTCPeerConnection`
pub struct RtcSession {
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<SessionState>>,
    candidates: Arc<Mutex<CandidateGate>>,
    events: SessionEvents,
    mtu: usize,
}

impl RtcSession {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn wire_callbacks(&self) {
        let events = self.events.clone();
        let gate = Arc::clone(&self.candidates);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {}", e);
                            return;
                        }
                    };
                    let local = LocalCandidate {
                        candidate: init.candidate,
                        mid: init.sdp_mid,
                        mline_index: init.sdp_mline_index,
                    };

                    let mut gate = gate.lock();
                    if gate.open {
                        events.emit(SessionEvent::LocalCandidate(local));
                    } else {
                        gate.pending.push(local);
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                let state = match s {
                    RTCSignalingState::Stable => Some(SignalingState::Stable),
                    RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
                    RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
                    RTCSignalingState::HaveLocalPranswer => {
                        Some(SignalingState::HaveLocalPranswer)
                    }
                    RTCSignalingState::HaveRemotePranswer => {
                        Some(SignalingState::HaveRemotePranswer)
                    }
                    RTCSignalingState::Closed => Some(SignalingState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    events.emit(SessionEvent::SignalingStateChanged(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        let session_state = Arc::clone(&self.state);
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(SessionState::New),
                    RTCPeerConnectionState::Connecting => Some(SessionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(SessionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(SessionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(SessionState::Failed),
                    RTCPeerConnectionState::Closed => Some(SessionState::Closed),
                    _ => None,
                };
                if let Some(new_state) = new_state {
                    let changed = {
                        let mut current = session_state.lock();
                        let changed = *current != new_state;
                        *current = new_state;
                        changed
                    };
                    if changed {
                        events.emit(SessionEvent::StateChanged(new_state));
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Report the description, then every candidate gathered so far
    fn release_candidates(&self) {
        let mut gate = self.candidates.lock();
        gate.open = true;
        for candidate in gate.pending.drain(..) {
            self.events.emit(SessionEvent::LocalCandidate(candidate));
        }
    }
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn add_track(&self, descriptor: &TrackDescriptor) -> Result<Arc<dyn TrackSender>> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            h264_capability(descriptor.clock_rate, &descriptor.fmtp),
            descriptor.track_id.clone(),
            descriptor.stream_id.clone(),
        ));

        let transceiver = self
            .pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add track '{}': {}", descriptor.mid, e))
            })?;
        let rtp_sender = transceiver.sender().await;

        // RTCP must be read for interceptors (NACK, reports) to run
        let rtcp_sender = Arc::clone(&rtp_sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        debug!(
            "Added track '{}' to session {} (ssrc hint {})",
            descriptor.mid, self.events.viewer_id(), descriptor.ssrc
        );

        Ok(Arc::new(RtpTrackSender {
            mid: descriptor.mid.clone(),
            track,
            rtp_sender,
            pc: Arc::downgrade(&self.pc),
            session_state: Arc::clone(&self.state),
            payloader: Mutex::new(H264Payloader::default()),
            sequence: AtomicU16::new(rand::random::<u16>()),
            ssrc: descriptor.ssrc,
            mtu: self.mtu,
            closed: AtomicBool::new(false),
        }))
    }

    async fn set_local_description(&self, kind: DescriptionKind) -> Result<()> {
        let description = match kind {
            DescriptionKind::Offer => self.pc.create_offer(None).await,
            DescriptionKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(|e| Error::SdpError(format!("Failed to create {}: {}", kind.as_str(), e)))?;

        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting it".to_string())
        })?;

        self.events
            .emit(SessionEvent::LocalDescription(SessionDescription {
                kind,
                sdp: local.sdp,
            }));
        self.release_candidates();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: Option<&str>,
        mline_index: Option<u16>,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: mid.map(str::to_string),
            sdp_mline_index: mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        info!("Closing session for {}", self.events.viewer_id());
        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

/// Send side of one H.264 track on one session
pub struct RtpTrackSender {
    mid: String,
    track: Arc<TrackLocalStaticRTP>,
    rtp_sender: Arc<RTCRtpSender>,
    pc: Weak<RTCPeerConnection>,
    session_state: Arc<Mutex<SessionState>>,
    payloader: Mutex<H264Payloader>,
    sequence: AtomicU16,
    ssrc: u32,
    mtu: usize,
    closed: AtomicBool,
}

#[async_trait]
impl TrackSender for RtpTrackSender {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && *self.session_state.lock() == SessionState::Connected
    }

    async fn send_frame(&self, payload: Bytes, info: FrameInfo) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TrackClosed(self.mid.clone()));
        }

        let payloads = self
            .payloader
            .lock()
            .payload(self.mtu, &payload)
            .map_err(|e| Error::MediaTrackError(format!("Failed to packetize frame: {}", e)))?;

        let last = payloads.len().saturating_sub(1);
        for (i, chunk) in payloads.into_iter().enumerate() {
            let packet = Packet {
                header: Header {
                    version: 2,
                    marker: i == last,
                    payload_type: info.payload_type,
                    sequence_number: self.sequence.fetch_add(1, Ordering::Relaxed),
                    timestamp: info.timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload: chunk,
            };
            self.track.write_rtp(&packet).await.map_err(|e| {
                Error::MediaTrackError(format!("Failed to write RTP packet on '{}': {}", self.mid, e))
            })?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing track '{}'", self.mid);
        if let Some(pc) = self.pc.upgrade() {
            pc.remove_track(&self.rtp_sender).await.map_err(|e| {
                Error::MediaTrackError(format!("Failed to remove track '{}': {}", self.mid, e))
            })?;
        }
        Ok(())
    }
}
