// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client handle of the encoder and its worker thread.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::encoder::codec::EncoderImpl;
use crate::encoder::dpb::DpbService;
use crate::encoder::hal::EncoderHal;
use crate::encoder::notify::Notifier;
use crate::encoder::notify::NotifyFlags;
use crate::encoder::notify::NotifyGate;
use crate::encoder::pipeline::Pipeline;
use crate::encoder::pipeline::Ports;
use crate::encoder::port::Port;
use crate::encoder::port::PortListener;
use crate::encoder::port::PortTimeout;
use crate::encoder::rc::RateController;
use crate::encoder::BackendError;
use crate::encoder::ControlCommand;
use crate::encoder::ControlReply;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::EncoderStats;
use crate::encoder::Frame;
use crate::encoder::Packet;

/// The pluggable parts of an encoder, chosen once at creation.
pub struct Collaborators {
    pub codec: Box<dyn EncoderImpl>,
    pub hal: Box<dyn EncoderHal>,
    pub rc: Box<dyn RateController>,
    pub dpb: Box<dyn DpbService>,
}

enum Request {
    Control(ControlCommand, SyncSender<EncodeResult<ControlReply>>),
    Reset(SyncSender<EncodeResult<()>>),
}

/// Requests for the worker, guarded by the gate lock.
#[derive(Default)]
struct Mailbox {
    requests: VecDeque<Request>,
    stop: bool,
    /// The worker is gone. Requests can no longer be answered.
    exited: bool,
}

impl Mailbox {
    /// Takes the requests that can be served now. Only resets are served in the middle of a
    /// frame, the others wait for the frame to be out.
    fn take_requests(&mut self, mid_frame: bool) -> Vec<Request> {
        if !mid_frame {
            return self.requests.drain(..).collect();
        }

        let (resets, deferred): (VecDeque<_>, VecDeque<_>) = self
            .requests
            .drain(..)
            .partition(|r| matches!(r, Request::Reset(_)));
        self.requests = deferred;
        resets.into()
    }
}

type Scheduler = NotifyGate<Mailbox>;

struct Worker {
    pipeline: Pipeline,
    scheduler: Arc<Scheduler>,
}

impl Worker {
    fn process_loop(mut self) {
        log::debug!("encoder worker started");

        let mut required = NotifyFlags::empty();
        loop {
            let (stop, requests) = {
                let mut state = self.scheduler.wait(required);
                state.wait.take_reserved(NotifyFlags::RESERVED);
                let mid_frame = self.pipeline.is_mid_frame();
                (state.shared.stop, state.shared.take_requests(mid_frame))
            };

            if stop {
                break;
            }

            for request in requests {
                self.serve(request);
            }

            required = self.pipeline.process();
        }

        self.pipeline.shutdown();

        // Answer whoever is still waiting: dropping the senders fails their calls.
        let mut state = self.scheduler.lock();
        state.shared.exited = true;
        state.shared.requests.clear();
        drop(state);

        log::debug!("encoder worker exited");
    }

    fn serve(&mut self, request: Request) {
        match request {
            Request::Control(command, reply) => {
                let result = self.pipeline.control(command).map(|reply| match reply {
                    ControlReply::Stats(mut stats) => {
                        stats.gate = self.scheduler.stats();
                        ControlReply::Stats(stats)
                    }
                    reply => reply,
                });
                if reply.send(result).is_err() {
                    log::warn!("control command requester went away");
                }
            }
            Request::Reset(reply) => {
                self.pipeline.reset();
                if reply.send(Ok(())).is_err() {
                    log::warn!("reset requester went away");
                }
            }
        }
    }
}

/// A running encoder instance.
///
/// Frames are queued with [`Encoder::put_frame`] and come back as packets from
/// [`Encoder::get_packet`], in the same order. The input frames themselves are handed back
/// through [`Encoder::reclaim_frame`] once their packet was produced.
pub struct Encoder {
    scheduler: Arc<Scheduler>,
    input: Port<Frame>,
    returned: Port<Frame>,
    output: Port<Packet>,
    input_timeout: PortTimeout,
    output_timeout: PortTimeout,
    worker_thread: Option<JoinHandle<()>>,
}

impl Encoder {
    pub fn new(config: EncoderConfig, collaborators: Collaborators) -> EncodeResult<Self> {
        let scheduler = Arc::new(Scheduler::default());
        let notifier: Arc<dyn Notifier> = scheduler.clone();

        let input = Port::new(
            "input",
            config.input_queue_depth,
            Some(PortListener {
                notifier: Arc::clone(&notifier),
                on_enqueue: NotifyFlags::INPUT,
                on_dequeue: NotifyFlags::empty(),
            }),
        );
        let output = Port::new(
            "output",
            config.output_queue_depth,
            Some(PortListener {
                notifier,
                on_enqueue: NotifyFlags::empty(),
                on_dequeue: NotifyFlags::OUTPUT,
            }),
        );
        let returned = Port::new("returned", usize::MAX, None);

        let input_timeout = config.input_timeout;
        let output_timeout = config.output_timeout;

        let ports = Ports {
            input: input.clone(),
            returned: returned.clone(),
            output: output.clone(),
        };
        let pipeline = Pipeline::new(config, collaborators, ports)?;

        let worker = Worker {
            pipeline,
            scheduler: Arc::clone(&scheduler),
        };
        let worker_thread = thread::Builder::new()
            .name("venc-worker".into())
            .spawn(move || worker.process_loop())
            .map_err(|e| BackendError::Other(e.into()))?;

        Ok(Self {
            scheduler,
            input,
            returned,
            output,
            input_timeout,
            output_timeout,
            worker_thread: Some(worker_thread),
        })
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    /// Queues `frame` for encoding, waiting up to the configured input timeout for room.
    pub fn put_frame(&self, frame: Frame) -> EncodeResult<()> {
        if !self.is_alive() {
            return Err(EncodeError::NotRunning);
        }

        match self.input.enqueue(frame, self.input_timeout) {
            Ok(()) => Ok(()),
            Err(_) if self.input.is_closed() => Err(EncodeError::NotRunning),
            Err(_) if self.input_timeout == PortTimeout::NonBlocking => {
                Err(EncodeError::QueueFull)
            }
            Err(_) => Err(EncodeError::Timeout),
        }
    }

    /// Takes the next packet, waiting up to the configured output timeout.
    pub fn get_packet(&self) -> Option<Packet> {
        self.get_packet_timeout(self.output_timeout)
    }

    pub fn get_packet_timeout(&self, timeout: PortTimeout) -> Option<Packet> {
        self.output.dequeue_timeout(timeout)
    }

    /// Takes back an input frame whose packet was produced.
    pub fn reclaim_frame(&self) -> Option<Frame> {
        self.returned.dequeue()
    }

    /// Runs `command` on the worker thread and waits for its answer.
    pub fn control(&self, command: ControlCommand) -> EncodeResult<ControlReply> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.post(
            NotifyFlags::CONTROL,
            Request::Control(command, sender),
        )?;
        receiver.recv().map_err(|_| EncodeError::NotRunning)?
    }

    /// Answers every queued frame without encoding it, and waits until the worker is ready to
    /// restart the stream.
    pub fn reset(&self) -> EncodeResult<()> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.post(NotifyFlags::RESET, Request::Reset(sender))?;
        receiver.recv().map_err(|_| EncodeError::NotRunning)?
    }

    pub fn stats(&self) -> EncodeResult<EncoderStats> {
        match self.control(ControlCommand::GetStats)? {
            ControlReply::Stats(stats) => Ok(stats),
            _ => Err(EncodeError::InvalidInternalState),
        }
    }

    /// Signals an external condition to the worker, eg. that hardware resources were released.
    pub fn notify(&self, flags: NotifyFlags) {
        self.scheduler.notify(flags - NotifyFlags::RESERVED);
    }

    fn post(&self, flags: NotifyFlags, request: Request) -> EncodeResult<()> {
        if !self.is_alive() {
            return Err(EncodeError::NotRunning);
        }

        let posted = self.scheduler.notify_with(flags, |mailbox| {
            if mailbox.exited || mailbox.stop {
                return false;
            }
            mailbox.requests.push_back(request);
            true
        });

        if posted {
            Ok(())
        } else {
            Err(EncodeError::NotRunning)
        }
    }

    /// Stops the worker. Frames in flight are completed, queued frames are abandoned.
    pub fn stop(&mut self) {
        self.scheduler
            .notify_with(NotifyFlags::STOP, |mailbox| mailbox.stop = true);
        self.input.close();

        if let Some(worker_thread) = self.worker_thread.take() {
            if worker_thread.join().is_err() {
                log::error!("encoder worker panicked");
            }
        }

        self.output.close();
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::FrameGenerator;
    use crate::encoder::ExecutionMode;
    use crate::encoder::FrameMetadata;
    use crate::encoder::PacketFlags;
    use crate::encoder::SliceSplit;

    fn start(config: EncoderConfig) -> (Encoder, DummyBackend) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = DummyBackend::new();
        let encoder = Encoder::new(config, backend.collaborators()).unwrap();
        (encoder, backend)
    }

    fn frame(timestamp: u64) -> Frame {
        Frame::new(
            FrameMetadata {
                timestamp,
                ..Default::default()
            },
            Bytes::from(vec![0x10u8; 64]),
        )
    }

    /// Collects packets until `count` frames ended.
    fn collect(encoder: &Encoder, count: usize) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut ended = 0;
        while ended < count {
            let packet = encoder
                .get_packet_timeout(PortTimeout::Timed(Duration::from_secs(5)))
                .expect("encoder stalled");
            if packet.is_frame_end() {
                ended += 1;
            }
            packets.push(packet);
        }
        packets
    }

    fn run_stream(config: EncoderConfig, frames: u64) {
        let (encoder, _backend) = start(config);
        let consumer = thread::scope(|s| {
            let handle = s.spawn(|| collect(&encoder, frames as usize));
            for ts in 0..frames {
                encoder.put_frame(frame(ts)).unwrap();
            }
            handle.join().unwrap()
        });

        let finals: Vec<&Packet> = consumer.iter().filter(|p| p.is_frame_end()).collect();
        assert_eq!(finals.len(), frames as usize);
        for (i, packet) in finals.iter().enumerate() {
            assert_eq!(packet.seq, i as u64);
            assert_eq!(packet.timestamp, i as u64);
        }

        let mut reclaimed = 0;
        while encoder.reclaim_frame().is_some() {
            reclaimed += 1;
        }
        assert_eq!(reclaimed, frames);
    }

    #[test]
    fn synchronous_stream() {
        run_stream(Default::default(), 30);
    }

    #[test]
    fn pipelined_stream() {
        run_stream(
            EncoderConfig {
                mode: ExecutionMode::Pipelined { tasks: 3 },
                ..Default::default()
            },
            30,
        );
    }

    #[test]
    fn low_delay_stream() {
        run_stream(
            EncoderConfig {
                split: SliceSplit::ByBlocks(60),
                low_delay: true,
                output_queue_depth: 2,
                ..Default::default()
            },
            10,
        );
    }

    #[test]
    fn control_round_trip() {
        let (encoder, _backend) = start(Default::default());

        match encoder.control(ControlCommand::GetHeader).unwrap() {
            ControlReply::Header(header) => assert!(!header.is_empty()),
            reply => panic!("unexpected reply {:?}", reply),
        }

        encoder.put_frame(frame(0)).unwrap();
        encoder.control(ControlCommand::RequestIdr).unwrap();
        encoder.put_frame(frame(1)).unwrap();
        let packets = collect(&encoder, 2);
        assert!(packets[0].is_idr());

        let stats = encoder.stats().unwrap();
        assert_eq!(stats.frames_admitted, 2);
        assert_eq!(stats.packets_emitted, 2);
        assert!(stats.gate.notifications > 0);
    }

    #[test]
    fn reset_answers_every_frame() {
        let (encoder, _backend) = start(EncoderConfig {
            input_queue_depth: 8,
            output_queue_depth: 16,
            ..Default::default()
        });

        for ts in 0..6 {
            encoder.put_frame(frame(ts)).unwrap();
        }
        encoder.reset().unwrap();
        encoder.put_frame(frame(6)).unwrap();

        let packets = collect(&encoder, 7);
        let seqs: Vec<u64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, (0..7).collect::<Vec<u64>>());

        let last = packets.last().unwrap();
        assert!(last.is_idr());
        assert!(last.header_len > 0);
        assert!(!last.flags.contains(PacketFlags::DISCARDED));
    }

    #[test]
    fn put_frame_on_full_queue() {
        let (mut encoder, _backend) = start(EncoderConfig {
            input_queue_depth: 1,
            output_queue_depth: 1,
            input_timeout: PortTimeout::NonBlocking,
            ..Default::default()
        });

        // The worker holds one frame waiting for output room and one is queued.
        let mut results = Vec::new();
        for ts in 0..4 {
            results.push(encoder.put_frame(frame(ts)));
            thread::sleep(Duration::from_millis(20));
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EncodeError::QueueFull))));

        encoder.stop();
        assert!(!encoder.is_alive());
        assert!(matches!(
            encoder.put_frame(frame(9)),
            Err(EncodeError::NotRunning)
        ));
        assert!(matches!(
            encoder.control(ControlCommand::RequestIdr),
            Err(EncodeError::NotRunning)
        ));
    }

    #[test]
    fn generated_frames() {
        let (encoder, _backend) = start(Default::default());
        let mut generator = FrameGenerator::new(EncoderConfig::default().resolution);
        for _ in 0..5 {
            encoder.put_frame(generator.next_frame()).unwrap();
        }
        encoder.put_frame(Frame::eos(5)).unwrap();

        let packets = collect(&encoder, 6);
        assert!(packets.last().unwrap().is_eos());
        assert!(packets[..5].iter().all(|p| !p.is_empty()));
    }
}
