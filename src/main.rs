//! ChurnForge: customer churn prediction CLI
//!
//! This is the main entrypoint that dispatches to training, single-customer
//! prediction, and batch scoring.

use anyhow::{Context, Result};
use churnforge::cli::Command;
use churnforge::data::{read_table, write_table};
use churnforge::inference::{ModelService, PREDICTION_COLUMN};
use churnforge::{train, Args};
use clap::Parser;
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match &args.command {
        Command::Train { .. } => run_training(&args.command)?,
        Command::Predict { model, .. } => run_prediction(&args.command, model)?,
        Command::Batch {
            model,
            input,
            output,
        } => run_batch(model, input, output)?,
    }

    Ok(())
}

/// RUST_LOG wins when set; otherwise `-v` raises the level from info.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Train, evaluate and persist a model
fn run_training(command: &Command) -> Result<()> {
    let Some(config) = command.train_config()? else {
        return Ok(());
    };

    println!("=== Training Pipeline ===\n");
    println!("  Input file: {}", config.data_path.display());
    println!(
        "  Grid: n_estimators={:?}, max_depth={:?}, {} folds",
        config.grid.n_estimators, config.grid.max_depth, config.cv_folds
    );

    let start_time = Instant::now();
    let report = train(&config)?;
    let elapsed = start_time.elapsed();

    println!("\n=== Churn Distribution ===");
    println!(
        "Stay: {:.1}%  Churn: {:.1}%",
        (1.0 - report.churn_rate) * 100.0,
        report.churn_rate * 100.0
    );

    println!("\n=== Evaluation ===");
    println!("{}", report);

    println!("\n=== Cross-Validation ===");
    for candidate in &report.candidates {
        println!("{}: mean ROC AUC {:.4}", candidate.params, candidate.mean_auc);
    }

    println!("\n✓ Model saved to: {}", config.model_out.display());
    println!("Total processing time: {:.2}s", elapsed.as_secs_f64());

    Ok(())
}

/// Predict churn for one customer
fn run_prediction(command: &Command, model: &Path) -> Result<()> {
    let Some(record) = command.record()? else {
        return Ok(());
    };

    let service = ModelService::new(model);
    let Some(prediction) = service.predict_one(&record)? else {
        anyhow::bail!(
            "Model not found at {}. Run `churnforge train` first.",
            model.display()
        );
    };

    println!("=== Prediction ===");
    println!("Prediction: {} ({})", prediction.label, prediction.outcome());
    println!("Churn probability: {:.2}%", prediction.percent());

    Ok(())
}

/// Score every row of a CSV and write the augmented table
fn run_batch(model: &Path, input: &Path, output: &Path) -> Result<()> {
    let service = ModelService::new(model);
    let table = read_table(input)
        .with_context(|| format!("Failed to read input CSV: {}", input.display()))?;

    let start_time = Instant::now();
    let Some(scored) = service.predict_batch(&table)? else {
        anyhow::bail!(
            "Model not found at {}. Run `churnforge train` first.",
            model.display()
        );
    };
    write_table(&scored, output)?;

    let churners = scored
        .column(PREDICTION_COLUMN)?
        .as_materialized_series()
        .i32()?
        .into_iter()
        .filter(|v| *v == Some(1))
        .count();

    println!("=== Batch Prediction ===");
    println!("✓ Scored {} customers", scored.height());
    println!(
        "  Predicted churners: {} ({:.1}%)",
        churners,
        100.0 * churners as f64 / scored.height().max(1) as f64
    );
    println!("  Output written to: {}", output.display());
    println!("  Processing time: {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}
