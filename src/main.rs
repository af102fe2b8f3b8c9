use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use image::{Rgb, RgbImage};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fgmask::extract::{create_extractor, Algorithm, ForegroundExtractor, FrameMeta};
use fgmask::params::{ChangeSet, RunMode, SharedParams};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    FrameDiff,
    StaticBackground,
    RollingAverage,
    AdaptiveMixture,
    OpticalFlow,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::FrameDiff => Algorithm::FrameDiff,
            AlgorithmArg::StaticBackground => Algorithm::StaticBackground,
            AlgorithmArg::RollingAverage => Algorithm::RollingAverage,
            AlgorithmArg::AdaptiveMixture => Algorithm::AdaptiveMixture,
            AlgorithmArg::OpticalFlow => Algorithm::OpticalFlow,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extraction algorithm
    #[arg(short, long, value_enum, default_value_t = AlgorithmArg::StaticBackground)]
    algorithm: AlgorithmArg,

    /// Synthetic frame width
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Synthetic frame height
    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Binarization threshold
    #[arg(short, long, default_value_t = 30)]
    threshold: u8,

    /// Working-resolution scale factor (0.1-1.0)
    #[arg(long, default_value_t = 1.0)]
    downscale: f32,

    /// Pre-blur size applied to frames and background (0 disables)
    #[arg(long, default_value_t = 0)]
    blur: u32,

    /// Number of synthetic frames to process
    #[arg(short, long, default_value_t = 300)]
    frames: u64,

    /// Propagate per-frame errors instead of degrading to blank output
    #[arg(long)]
    tuning: bool,

    /// Directory to dump binary masks into as PNGs
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Synthetic stand-in for the capture stage: a flat gray background with a
/// bright square wandering across it.
struct SyntheticScene {
    width: u32,
    height: u32,
    index: u64,
}

impl SyntheticScene {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            index: 0,
        }
    }

    fn background(&self) -> RgbImage {
        RgbImage::from_pixel(self.width, self.height, Rgb([90, 90, 90]))
    }

    fn next_frame(&mut self) -> RgbImage {
        let mut frame = self.background();
        let side = (self.width.min(self.height) / 8).max(4);
        let span_x = (self.width.saturating_sub(side) as u64).max(1);
        let span_y = (self.height.saturating_sub(side) as u64).max(1);
        let x0 = ((self.index * 3) % span_x) as u32;
        let y0 = ((self.index * 2) % span_y) as u32;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        self.index += 1;
        frame
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("fgmask starting");
    tracing::info!("Algorithm: {:?}", args.algorithm);
    tracing::info!(
        "Frames: {}x{}, downscale {}",
        args.width,
        args.height,
        args.downscale
    );

    let shared = SharedParams {
        input_size: (args.width, args.height),
        downscale_factor: args.downscale,
        pre_blur_size: args.blur,
        threshold: args.threshold,
        run_mode: if args.tuning {
            RunMode::Tuning
        } else {
            RunMode::Production
        },
        ..SharedParams::default()
    };

    let mut extractor = create_extractor(args.algorithm.into(), shared);
    extractor
        .setup(&ChangeSet::new())
        .context("Failed to configure extractor")?;

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create dump dir {}", dir.display()))?;
    }

    run_pipeline(extractor.as_mut(), &args)?;

    extractor.close();
    Ok(())
}

fn run_pipeline(extractor: &mut dyn ForegroundExtractor, args: &Args) -> Result<()> {
    let mut scene = SyntheticScene::new(args.width, args.height);
    let background = scene.background();

    let mut total_extract_time = Duration::ZERO;
    let mut total_coverage = 0.0f64;

    tracing::info!("Starting main pipeline loop");

    for index in 0..args.frames {
        let frame = scene.next_frame();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let meta = FrameMeta::new(index, epoch_ms, Instant::now());

        // The background is delivered once up front, the way a background
        // capture stage would hand one over after its first averaging pass.
        let refreshed = index == 0;

        let extract_start = Instant::now();
        let output = extractor
            .run(&frame, Some(&background), refreshed, meta)
            .context("Failed to extract foreground")?;
        let extract_time = extract_start.elapsed();
        total_extract_time += extract_time;

        let (w, h) = output.binary.dimensions();
        let foreground = output.binary.pixels().filter(|p| p[0] == 255).count();
        total_coverage += foreground as f64 / (w as f64 * h as f64);

        if let Some(dir) = &args.dump_dir {
            let path = dir.join(format!("mask_{index:05}.png"));
            output
                .binary
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        // Log stats every 30 frames
        if (index + 1) % 30 == 0 {
            let frames_done = (index + 1) as f64;
            let avg_extract_ms = total_extract_time.as_secs_f64() * 1000.0 / frames_done;
            tracing::info!(
                "Frame {}: extract={:.2}ms avg, coverage={:.2}% avg",
                index + 1,
                avg_extract_ms,
                100.0 * total_coverage / frames_done
            );
        }
    }

    tracing::info!("Pipeline finished");
    Ok(())
}
