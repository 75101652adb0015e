//! Track per-region froth overflow velocity from a camera or video file

use clap::*;
use froth_cv::{CvCapture, CvEstimatorFactory, VideoSource};
use froth_flow::prelude::v1::{Result, *};
use log::*;

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("froth-monitor")
        .version(crate_version!())
        .about("Tracks froth overflow velocity per region")
        .arg(
            Arg::new("input")
                .takes_value(true)
                .required(true)
                .help("Camera index or video file path"),
        )
        .arg(
            Arg::new("roi")
                .long("roi")
                .short('r')
                .takes_value(true)
                .multiple_occurrences(true)
                .required(true)
                .help("Tracked region as x,y,w,h (repeatable)"),
        )
        .arg(
            Arg::new("ruler-px")
                .long("ruler-px")
                .takes_value(true)
                .default_value("1")
                .help("Measured pixel length of the calibration ruler"),
        )
        .arg(
            Arg::new("ruler-mm")
                .long("ruler-mm")
                .takes_value(true)
                .default_value("1")
                .help("Physical length of the calibration ruler in mm"),
        )
        .arg(
            Arg::new("degree")
                .long("degree")
                .short('d')
                .takes_value(true)
                .default_value("-90")
                .help("Overflow direction in degrees, counterclockwise from +x"),
        )
        .arg(
            Arg::new("algorithm")
                .long("algorithm")
                .short('a')
                .takes_value(true)
                .default_value(froth_flow::flow::FARNEBACK)
                .help("Optical flow algorithm: farneback or lucas-kanade"),
        )
        .get_matches();

    let input = matches.value_of("input").unwrap();
    let ruler_px: f32 = matches.value_of("ruler-px").unwrap().parse()?;
    let ruler_mm: f32 = matches.value_of("ruler-mm").unwrap().parse()?;
    let degree: f32 = matches.value_of("degree").unwrap().parse()?;
    let params = FlowParams::from_name(matches.value_of("algorithm").unwrap())?;

    let mut pipeline = Pipeline::new(Box::new(CvEstimatorFactory));
    pipeline.set_params(params)?;
    pipeline.set_direction(degree);

    let calibration = Calibration::from_measurement(ruler_px, ruler_mm, degree)?;
    pipeline.set_calibration(calibration.px_per_mm())?;

    for roi in matches.values_of("roi").unwrap() {
        pipeline.add_roi(parse_rect(roi)?)?;
    }

    let source = VideoSource::parse(input);
    let capture = CvCapture::open(&source)?;

    let (sink, frames) = frame_gate();
    let mut feed = FrameFeed::new();
    feed.start(capture, source.kind(), sink);

    let (width, height) = feed.dimensions();
    info!(
        "capture started: {}x{} @ {:.1} fps, {} region(s), {} px/mm, {} deg",
        width,
        height,
        feed.frame_rate(),
        pipeline.trackers().len(),
        calibration.px_per_mm(),
        degree
    );

    // One frame in flight at a time; frames arriving while the pipeline is
    // busy are shed by the gate.
    while let Some(frame) = frames.recv() {
        let outcome = pipeline.process(&frame)?;

        if outcome.new_velocity || outcome.new_average {
            report(&pipeline, outcome);
        }

        frames.release();
    }

    feed.stop();

    println!("processed {} frames", pipeline.frame_count());
    for (i, tracker) in pipeline.trackers().iter().enumerate() {
        println!(
            "region {}: {} velocity samples, average {}",
            i + 1,
            tracker.velocity_history().len(),
            tracker
                .average_velocity()
                .map(|v| format!("{:.3} mm/s", v))
                .unwrap_or_else(|| "n/a".into()),
        );
    }

    Ok(())
}

fn report(pipeline: &Pipeline, outcome: ProcessOutcome) {
    let stamp = chrono::Local::now().format("%d/%m/%Y %H:%M:%S%.3f");

    for (i, tracker) in pipeline.trackers().iter().enumerate() {
        let velocity = match tracker.velocity_history().last() {
            Some(v) => *v,
            None => continue,
        };

        match tracker.average_velocity() {
            Some(avg) if outcome.new_average => println!(
                "[{}] frame {} region {}: {:.3} mm/s (30 s average {:.3} mm/s)",
                stamp,
                outcome.frame_count,
                i + 1,
                velocity,
                avg
            ),
            _ => println!(
                "[{}] frame {} region {}: {:.3} mm/s",
                stamp,
                outcome.frame_count,
                i + 1,
                velocity
            ),
        }
    }
}

fn parse_rect(spec: &str) -> Result<RoiRect> {
    let parts = spec
        .split(',')
        .map(|p| p.trim().parse())
        .collect::<core::result::Result<Vec<i32>, _>>()
        .map_err(|_| anyhow!("invalid region {:?}, expected x,y,w,h", spec))?;

    match parts.as_slice() {
        [x, y, w, h] => {
            let rect = RoiRect::new(*x, *y, *w, *h);

            if !rect.is_valid() {
                return Err(anyhow!("region {:?} has a non-positive size or origin", spec));
            }

            Ok(rect)
        }
        _ => Err(anyhow!("invalid region {:?}, expected x,y,w,h", spec)),
    }
}
