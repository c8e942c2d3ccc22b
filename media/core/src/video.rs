//! Video worker thread: echoes received frames back when echo mode is on,
//! parks on a condition variable while passive, exits when told to.

use rtp::RtpPacket;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct VideoShared {
    state: Mutex<VideoState>,
    cond: Condvar,
}

struct VideoState {
    up: bool,
    passive: bool,
    echo: bool,
    queue: VecDeque<RtpPacket>,
}

pub struct VideoWorker {
    shared: Arc<VideoShared>,
    thread: Option<JoinHandle<()>>,
}

impl VideoWorker {
    /// Spawn the worker. `echo_out` receives every frame looped back while
    /// echo mode is active.
    pub fn spawn(mut echo_out: impl FnMut(RtpPacket) + Send + 'static) -> Self {
        let shared = Arc::new(VideoShared {
            state: Mutex::new(VideoState {
                up: true,
                passive: false,
                echo: true,
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("video-worker".into())
            .spawn(move || {
                let mut state = thread_shared.state.lock().unwrap();

                loop {
                    if !state.up {
                        break;
                    }

                    if state.passive || state.queue.is_empty() {
                        state = thread_shared.cond.wait(state).unwrap();
                        continue;
                    }

                    let echo = state.echo;
                    while let Some(frame) = state.queue.pop_front() {
                        if echo && !state.passive {
                            drop(state);
                            echo_out(frame);
                            state = thread_shared.state.lock().unwrap();
                        }
                    }
                }
            })
            .expect("spawn video worker");

        VideoWorker {
            shared,
            thread: Some(thread),
        }
    }

    pub fn push_frame(&self, frame: RtpPacket) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push_back(frame);
        drop(state);
        self.shared.cond.notify_all();
    }

    pub fn set_passive(&self, passive: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.passive = passive;
        drop(state);
        self.shared.cond.notify_all();
    }

    pub fn set_echo(&self, echo: bool) {
        self.shared.state.lock().unwrap().echo = echo;
    }

    pub fn is_passive(&self) -> bool {
        self.shared.state.lock().unwrap().passive
    }

    pub fn echo_enabled(&self) -> bool {
        self.shared.state.lock().unwrap().echo
    }

    /// Wake the worker up, e.g. after flipping passive off.
    pub fn wake(&self) {
        self.shared.cond.notify_all();
    }

    /// Flag the loop down and join the thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.up = false;
        }
        self.shared.cond.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for VideoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtp::{RtpTimestamp, SequenceNumber, Ssrc};
    use std::sync::mpsc;
    use std::time::Duration;

    fn frame(seq: u16) -> RtpPacket {
        RtpPacket {
            pt: 96,
            sequence_number: SequenceNumber(seq),
            ssrc: Ssrc(1),
            timestamp: RtpTimestamp(0),
            extensions: Default::default(),
            payload: Bytes::from_static(&[0u8; 100]),
        }
    }

    #[test]
    fn echoes_frames_until_stopped() {
        let (tx, rx) = mpsc::channel();

        let mut worker = VideoWorker::spawn(move |frame| {
            let _ = tx.send(frame.sequence_number.0);
        });

        worker.push_frame(frame(1));
        worker.push_frame(frame(2));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);

        worker.stop();
    }

    #[test]
    fn passive_worker_holds_frames() {
        let (tx, rx) = mpsc::channel();

        let mut worker = VideoWorker::spawn(move |frame| {
            let _ = tx.send(frame.sequence_number.0);
        });

        worker.set_passive(true);
        worker.push_frame(frame(7));

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        worker.set_passive(false);
        worker.wake();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);

        worker.stop();
    }
}
