use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vision_facade_rs::{
    config::{Cli, Command, EncodeTextArgs, SamArgs},
    BatchDriver, Config, Sam, TensorBundle, TextEncoder, YoloDetector, TEXT_EMBEDDINGS,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Detect(config) => detect(config),
        Command::Sam(args) => segment(args),
        Command::EncodeText(args) => encode_text(args),
    }
}

fn detect(config: Config) -> Result<()> {
    ensure!(config.input_dir.is_dir(), "Input directory does not exist");
    ensure!(config.workers > 0, "At least one worker is required");

    let detector = YoloDetector::from_config(&config.config)
        .with_context(|| format!("Failed to load detector: {}", config.config.display()))?;
    let driver = BatchDriver::new(detector, config)?;
    let report = driver.process()?;

    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    info!(
        processed = report.processed,
        skipped = report.skipped.len(),
        "done"
    );
    Ok(())
}

fn segment(args: SamArgs) -> Result<()> {
    let image = image::open(&args.image)
        .with_context(|| format!("Failed to open image: {}", args.image.display()))?
        .into_rgb8();

    let mut sam = Sam::new(&args.encoder, &args.decoder).context("Failed to load SAM")?;
    sam.set_image(&image)?;

    let points: Vec<(i32, i32)> = args.points.iter().map(|p| (p.x, p.y)).collect();
    let labels: Vec<f32> = args.points.iter().map(|p| p.label).collect();
    let mask = sam.predict(&points, &labels)?;

    mask.save(&args.output)
        .with_context(|| format!("Failed to save mask: {}", args.output.display()))?;
    info!(output = %args.output.display(), "mask written");
    Ok(())
}

fn encode_text(args: EncodeTextArgs) -> Result<()> {
    let encoder = TextEncoder::from_config(&args.config)
        .with_context(|| format!("Failed to load text encoder: {}", args.config.display()))?;

    let mut features = TensorBundle::new();
    encoder.forward(&args.texts, &mut features)?;
    let embeddings = features.f32_view(TEXT_EMBEDDINGS)?;

    println!("text_embeddings {:?}", embeddings.shape());
    for (text, row) in args.texts.iter().zip(embeddings.outer_iter()) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        println!("{text:?}: norm {norm:.4}");
    }
    Ok(())
}
