//! Control-plane messages into the media layer.

use crate::config::{ConfigView, MediaFlag, vars};
use crate::env::MediaEvent;
use crate::error::MediaError;
use crate::transport::JitterBuffer;
use crate::{MediaHandle, MediaType};

/// The message set the core accepts from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaMessage {
    /// Ask the peer for a video keyframe.
    VideoRefreshReq,
    /// Toggle media passthrough on the live transport.
    ProxyMedia(bool),
    /// Jitter buffer control: a `<len>[:<max>[:<drift>]]` spec, `pause`,
    /// `resume`, `debug:<level>`, or empty to deactivate.
    JitterBuffer(String),
    Bridge,
    Unbridge,
    AudioSync,
    /// Operate without media, absorbing the SDP.
    NoMedia,
    /// Renegotiate, optionally with a fresh codec preference string.
    MediaReneg(Option<String>),
    /// Switch the audio stream to UDPTL framing (T.38).
    UdptlMode,
    /// The bridge requires transcoding; only logged.
    TranscodingNecessary,
}

pub(crate) fn receive_message(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    msg: MediaMessage,
) -> Result<(), MediaError> {
    match msg {
        MediaMessage::VideoRefreshReq => {
            if let Some(worker) = &handle.engine(MediaType::Video).video_worker {
                worker.wake();
            }
            handle.env.raise(MediaEvent::VideoRefreshRequested);
        }

        MediaMessage::ProxyMedia(on) => {
            handle.flags.put(MediaFlag::ProxyMedia, on);
            if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                transport.set_proxy_media(on);
            }
        }

        MediaMessage::JitterBuffer(spec) => {
            let frame_ms = handle.engine(MediaType::Audio).codec_params.ptime.max(1);

            let mut paused = None;

            {
                let engine = handle.engine_mut(MediaType::Audio);

                let Some(transport) = &mut engine.transport else {
                    return Err(MediaError::NotReady);
                };

                if spec.eq_ignore_ascii_case("pause") {
                    transport.pause_jitter_buffer(true);
                    paused = Some(true);
                } else if spec.eq_ignore_ascii_case("resume") {
                    transport.pause_jitter_buffer(false);
                    paused = Some(false);
                } else if let Some(level) = spec.strip_prefix("debug:") {
                    log::info!("jitter buffer debug level set to {level}");
                } else if spec.is_empty() || spec.starts_with('0') {
                    transport.deactivate_jitter_buffer();
                } else if let Some(jb) = JitterBuffer::parse(&spec, frame_ms) {
                    transport.activate_jitter_buffer(jb);
                }
            }

            match paused {
                Some(true) => handle.flags.set(MediaFlag::JitterBufferPaused),
                Some(false) => handle.flags.clear(MediaFlag::JitterBufferPaused),
                None => {}
            }
        }

        MediaMessage::Bridge => {
            let jb_active = handle
                .engine(MediaType::Audio)
                .transport
                .as_ref()
                .is_some_and(|t| t.jitter_buffer().is_some());

            if jb_active && !cfg.is_true(vars::RTP_JITTER_BUFFER_DURING_BRIDGE) {
                if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                    transport.pause_jitter_buffer(true);
                }
                handle.flags.set(MediaFlag::JitterBufferPaused);
            }

            // the bridge relays video from here on, park the echo worker
            if let Some(worker) = &handle.engine(MediaType::Video).video_worker {
                worker.set_passive(true);
                handle.flags.set(MediaFlag::VideoPassive);
            }
        }

        MediaMessage::Unbridge => {
            if handle.flags.test(MediaFlag::JitterBufferPaused) {
                if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                    transport.pause_jitter_buffer(false);
                }
                handle.flags.clear(MediaFlag::JitterBufferPaused);
            }

            if let Some(worker) = &handle.engine(MediaType::Video).video_worker {
                worker.set_passive(false);
                worker.wake();
                handle.flags.clear(MediaFlag::VideoPassive);
            }
        }

        MediaMessage::AudioSync => {
            if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                transport.reset_media_timer();
            }
        }

        MediaMessage::NoMedia => {
            handle.flags.set(MediaFlag::ProxyMode);
        }

        MediaMessage::MediaReneg(codec_string) => {
            if let Some(codec_string) = codec_string {
                cfg.set(vars::CODEC_STRING, &codec_string);
            }

            handle.negotiated_codecs.clear();
            handle.prepare_codecs(cfg, true);
            handle.flags.set(MediaFlag::Reinvite);
        }

        MediaMessage::UdptlMode => {
            crate::provision::udptl_mode(handle)?;
        }

        MediaMessage::TranscodingNecessary => {
            log::warn!("transcoding is required for this bridge, performance will suffer");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaParams, MemoryConfig};
    use crate::env::MediaEnvironment;
    use crate::video::VideoWorker;
    use crate::{CallDirection, MediaHandle};

    fn handle_with_video_worker() -> MediaHandle {
        let mut handle = MediaHandle::new(
            MediaEnvironment::new(),
            MediaParams::default(),
            CallDirection::Inbound,
        );

        handle.engine_mut(MediaType::Video).video_worker = Some(VideoWorker::spawn(|_| {}));
        handle.flags.set(MediaFlag::VideoEcho);

        handle
    }

    fn worker_of(handle: &MediaHandle) -> &VideoWorker {
        handle
            .engine(MediaType::Video)
            .video_worker
            .as_ref()
            .unwrap()
    }

    #[test]
    fn bridge_parks_the_video_echo_worker() {
        let mut handle = handle_with_video_worker();
        let mut cfg = MemoryConfig::new();

        handle
            .receive_message(&mut cfg, MediaMessage::Bridge)
            .unwrap();
        assert!(handle.flags.test(MediaFlag::VideoPassive));
        assert!(worker_of(&handle).is_passive());

        handle
            .receive_message(&mut cfg, MediaMessage::Unbridge)
            .unwrap();
        assert!(!handle.flags.test(MediaFlag::VideoPassive));
        assert!(!worker_of(&handle).is_passive());
    }

    #[test]
    fn echo_toggle_reaches_the_worker() {
        let mut handle = handle_with_video_worker();

        handle.set_video_echo(false);
        assert!(!handle.flags.test(MediaFlag::VideoEcho));
        assert!(!worker_of(&handle).echo_enabled());

        handle.set_video_echo(true);
        assert!(handle.flags.test(MediaFlag::VideoEcho));
        assert!(worker_of(&handle).echo_enabled());
    }
}
