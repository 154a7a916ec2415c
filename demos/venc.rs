// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the encoder pipeline over the software backend and writes the produced stream.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use argh::FromArgs;
use bytes::Bytes;
use cros_venc::backend::dummy::DummyBackend;
use cros_venc::backend::dummy::FrameGenerator;
use cros_venc::encoder::port::PortTimeout;
use cros_venc::encoder::ControlCommand;
use cros_venc::encoder::ControlReply;
use cros_venc::encoder::Encoder;
use cros_venc::encoder::EncoderConfig;
use cros_venc::encoder::ExecutionMode;
use cros_venc::encoder::Frame;
use cros_venc::encoder::FrameMetadata;
use cros_venc::encoder::RateControl;
use cros_venc::encoder::SliceSplit;
use cros_venc::encoder::Tunings;
use cros_venc::EncodedFormat;
use cros_venc::Resolution;

/// Simple encoder
#[derive(Debug, FromArgs)]
struct Args {
    /// raw NV12 input file. Synthetic frames are encoded if absent.
    #[argh(option)]
    input: Option<PathBuf>,

    /// input frames width
    #[argh(option, default = "320")]
    width: u32,

    /// input frames height
    #[argh(option, default = "240")]
    height: u32,

    /// input frames count
    #[argh(option, default = "60")]
    count: usize,

    /// coded format (h264, h265, vp8, vp9, av1, mjpeg)
    #[argh(option, default = "EncodedFormat::H264")]
    codec: EncodedFormat,

    /// framerate
    #[argh(option, default = "30")]
    framerate: u32,

    /// constant bitrate in bits per second
    #[argh(option)]
    bitrate: Option<u64>,

    /// constant quality parameter, overrides the bitrate
    #[argh(option)]
    quality: Option<u32>,

    /// number of frames in flight. Frames are encoded one at a time if absent.
    #[argh(option)]
    pipelined: Option<usize>,

    /// start a new slice every given number of blocks
    #[argh(option)]
    slice_blocks: Option<u32>,

    /// emit every slice as a separate packet
    #[argh(switch)]
    low_delay: bool,

    /// run a lookahead pass ahead of intra frames
    #[argh(switch)]
    two_pass: bool,

    /// output file to write the coded stream to
    #[argh(option)]
    output: Option<PathBuf>,

    /// print the MD5 digest of the coded stream
    #[argh(switch)]
    compute_md5: bool,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let resolution = Resolution {
        width: args.width,
        height: args.height,
    };

    let rate_control = match (args.quality, args.bitrate) {
        (Some(quality), _) => RateControl::ConstantQuality(quality),
        (None, Some(bitrate)) => RateControl::ConstantBitrate(bitrate),
        (None, None) => Tunings::default().rate_control,
    };

    let config = EncoderConfig {
        format: args.codec,
        resolution,
        tunings: Tunings {
            rate_control,
            framerate: args.framerate,
            ..Default::default()
        },
        mode: match args.pipelined {
            Some(tasks) => ExecutionMode::Pipelined { tasks },
            None => ExecutionMode::Synchronous,
        },
        split: args
            .slice_blocks
            .map_or(SliceSplit::Disabled, SliceSplit::ByBlocks),
        low_delay: args.low_delay,
        two_pass: args.two_pass,
        output_timeout: PortTimeout::Timed(Duration::from_secs(1)),
        ..Default::default()
    };

    let backend = DummyBackend::new();
    let encoder = Encoder::new(config, backend.collaborators()).expect("failed to create encoder");

    let mut output = args
        .output
        .as_ref()
        .map(|path| File::create(path).expect("error creating output file"));

    let mut input = args
        .input
        .as_ref()
        .map(|path| File::open(path).expect("error opening input file"));
    let frame_size = (resolution.width * resolution.height * 3 / 2) as usize;
    let mut generator = FrameGenerator::new(resolution);

    let (stream, packets) = thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut stream = Vec::new();
            let mut packets = 0usize;
            loop {
                let Some(packet) = encoder.get_packet() else {
                    log::warn!("no packet within the output timeout");
                    continue;
                };
                packets += 1;
                stream.extend_from_slice(&packet.data);
                if packet.is_eos() {
                    break;
                }
            }
            (stream, packets)
        });

        for timestamp in 0..args.count as u64 {
            let frame = match input.as_mut() {
                Some(input) => {
                    let mut raw = vec![0u8; frame_size];
                    input
                        .read_exact(&mut raw)
                        .expect("error reading input file");
                    Frame::new(
                        FrameMetadata {
                            timestamp,
                            display_resolution: resolution,
                            ..Default::default()
                        },
                        Bytes::from(raw),
                    )
                }
                None => generator.next_frame(),
            };

            encoder.put_frame(frame).expect("failed to queue frame");
            while encoder.reclaim_frame().is_some() {}
        }

        encoder
            .put_frame(Frame::eos(args.count as u64))
            .expect("failed to queue end of stream");

        consumer.join().expect("consumer thread panicked")
    });

    if let Some(output) = output.as_mut() {
        output.write_all(&stream).expect("error writing output file");
    }

    if let Ok(ControlReply::Stats(stats)) = encoder.control(ControlCommand::GetStats) {
        log::info!("{:?}", stats);
    }

    println!("{} frames, {} packets, {} bytes", args.count, packets, stream.len());
    if args.compute_md5 {
        println!("{:x}", md5::compute(&stream));
    }
}
