use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use colored::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use patchcore_inspect::config::AppConfig;
use patchcore_inspect::types::AnalysisResponse;
use patchcore_inspect::InferenceContext;

mod args;

use args::Args;

fn analyze_file(context: &InferenceContext, path: &Path, args: &Args) -> anyhow::Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let start = Instant::now();

    let report = match context.analyze(&bytes) {
        Ok(report) => report,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            let response = AnalysisResponse::failure(e.to_string());
            print_failure(path, e.status_code(), &response, args.json)?;
            return Ok(false);
        }
    };

    if let Some(dir) = &args.out_dir {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        report
            .renderings
            .save_all(dir, &stem)
            .with_context(|| format!("writing renderings to {}", dir.display()))?;
        info!("renderings written to {}", dir.display());
    }

    let result = &report.result;
    let verdict = if result.is_anomaly {
        "ANOMALY".red().bold()
    } else {
        "NORMAL".green().bold()
    };
    println!(
        "{} {} score {:.4} / threshold {:.4} (confidence {:.2})",
        verdict,
        path.display(),
        result.anomaly_score,
        result.threshold,
        result.confidence
    );

    if args.json {
        let mut results = report.into_results(0.0)?;
        results.processing_time = start.elapsed().as_secs_f64();
        println!(
            "{}",
            serde_json::to_string_pretty(&AnalysisResponse::success(results))?
        );
    }
    Ok(true)
}

fn print_failure(path: &Path, code: u16, response: &AnalysisResponse, json: bool) -> anyhow::Result<()> {
    println!(
        "{} {} ({}) {}",
        "FAILED".yellow().bold(),
        path.display(),
        code,
        response.error.as_deref().unwrap_or_default()
    );
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);
    if args.write_config {
        config
            .save(&args.config)
            .with_context(|| format!("saving {}", args.config.display()))?;
        info!("configuration saved to {}", args.config.display());
    }

    let context = InferenceContext::load(&config);

    if args.status || args.image.is_empty() {
        let status = context.status();
        println!("{}", serde_json::to_string_pretty(&status)?);
        if !status.model_loaded {
            println!("{}", status.state.yellow());
        }
        return Ok(());
    }

    let mut failures = 0;
    for path in &args.image {
        if !analyze_file(&context, path, &args)? {
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} images could not be analyzed", failures, args.image.len());
    }
    Ok(())
}
