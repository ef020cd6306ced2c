use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use autobattle::config::Config;
use autobattle::detector::{CORRELATION_THRESHOLD, Detector};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("Usage: match_test <template.png> <screenshot.png> [screenshot2.png ...]");
    }

    let threshold = Config::from_env()
        .context("failed to load configuration")?
        .match_threshold;

    let template_path = &args[1];
    let template = image::open(template_path)
        .with_context(|| format!("failed to load template {template_path}"))?
        .to_luma8();
    println!(
        "Template: {} ({}x{})",
        template_path,
        template.width(),
        template.height()
    );

    let detector = Detector::default();
    let cascade: Vec<String> = detector.strategies().map(|k| format!("{k:?}")).collect();
    println!("Cascade: {}", cascade.join(" -> "));
    println!(
        "Threshold: {threshold:.2} (correlation {:.2})",
        threshold.max(CORRELATION_THRESHOLD)
    );
    println!();

    for screenshot_path in &args[2..] {
        let screenshot = match image::open(screenshot_path) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                eprintln!("Failed to load {screenshot_path}: {e}");
                continue;
            }
        };

        let candidates = detector.locate(&screenshot, &template, threshold);
        match candidates.first() {
            Some(first) => {
                println!(
                    "{screenshot_path}: MATCH via {:?}, {} candidate(s)",
                    first.strategy,
                    candidates.len()
                );
                for c in &candidates {
                    println!("    center=({}, {}) score={:.4}", c.x, c.y, c.score);
                }
            }
            None => println!("{screenshot_path}: no match"),
        }
    }

    Ok(())
}
