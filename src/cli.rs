//! Command-line interface definitions and argument parsing

use crate::data::{CleanConfig, LabelPolicy, MissingPolicy};
use crate::inference::DEFAULT_MODEL_PATH;
use crate::record::{CustomerRecord, FieldValue, DEFAULT_TARGET};
use crate::train::{ParamGrid, TrainConfig, DEFAULT_DATA_PATH};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Customer churn prediction with a random forest over Telco account data
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train a model from a labeled CSV and save it
    Train {
        /// Path to the labeled input CSV
        #[arg(short, long, default_value = DEFAULT_DATA_PATH)]
        data: PathBuf,

        /// Where to write the model artifact
        #[arg(short, long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,

        /// Name of the label column
        #[arg(long, default_value = DEFAULT_TARGET)]
        target: String,

        /// Fraction of rows held out for evaluation
        #[arg(long, default_value = "0.2")]
        test_size: f64,

        /// Number of cross-validation folds
        #[arg(long, default_value = "3")]
        folds: usize,

        /// Random seed for splits and forests
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ensemble sizes to search, comma-separated
        #[arg(long, value_delimiter = ',', default_value = "100,200")]
        n_estimators: Vec<usize>,

        /// Maximum tree depths to search, comma-separated; "none" means unlimited
        #[arg(long, value_delimiter = ',', default_value = "8,12,none")]
        max_depth: Vec<String>,

        /// What to do with rows that still have missing values after cleaning
        #[arg(long, value_enum, default_value = "drop")]
        missing: MissingArg,

        /// Reject label values other than yes/no style tokens
        #[arg(long)]
        strict_labels: bool,
    },

    /// Predict churn for a single customer
    Predict {
        /// Path to the model artifact
        #[arg(short, long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,

        /// Customer as a JSON object of field -> value
        #[arg(long, conflicts_with = "field")]
        json: Option<String>,

        /// Customer field as name=value; repeat for every field
        /// Example: --field tenure=12 --field Contract=Month-to-month
        #[arg(short, long)]
        field: Vec<String>,
    },

    /// Predict churn for every row of a CSV file
    Batch {
        /// Path to the model artifact
        #[arg(short, long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,

        /// Input CSV with the customer feature columns
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV path
        #[arg(short, long, default_value = "bulk_predictions.csv")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MissingArg {
    Drop,
    Keep,
}

impl From<MissingArg> for MissingPolicy {
    fn from(arg: MissingArg) -> Self {
        match arg {
            MissingArg::Drop => MissingPolicy::DropRows,
            MissingArg::Keep => MissingPolicy::Keep,
        }
    }
}

/// Parse depth tokens; "none" (any case) is unlimited depth.
pub fn parse_depths(tokens: &[String]) -> crate::Result<Vec<Option<usize>>> {
    tokens
        .iter()
        .map(|t| {
            let t = t.trim();
            if t.eq_ignore_ascii_case("none") {
                Ok(None)
            } else {
                t.parse::<usize>()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("Invalid max depth value: {}", t))
            }
        })
        .collect()
}

/// Build a record from `name=value` pairs.
/// Values that parse as numbers become numeric fields, everything else text.
pub fn parse_fields(fields: &[String]) -> crate::Result<CustomerRecord> {
    let mut record = CustomerRecord::new();
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Field must be in format 'name=value': {}", field))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Field name is empty in '{}'", field);
        }
        record.insert(name, FieldValue::parse_token(value));
    }
    Ok(record)
}

impl Command {
    /// Training configuration for the `train` subcommand.
    pub fn train_config(&self) -> crate::Result<Option<TrainConfig>> {
        let Command::Train {
            data,
            model,
            target,
            test_size,
            folds,
            seed,
            n_estimators,
            max_depth,
            missing,
            strict_labels,
        } = self
        else {
            return Ok(None);
        };

        Ok(Some(TrainConfig {
            data_path: data.clone(),
            model_out: model.clone(),
            target_column: target.clone(),
            clean: CleanConfig {
                missing: (*missing).into(),
                ..CleanConfig::default()
            },
            labels: if *strict_labels {
                LabelPolicy::Strict
            } else {
                LabelPolicy::Lenient
            },
            test_size: *test_size,
            cv_folds: *folds,
            seed: *seed,
            grid: ParamGrid {
                n_estimators: n_estimators.clone(),
                max_depth: parse_depths(max_depth)?,
            },
            ..TrainConfig::default()
        }))
    }

    /// Customer record for the `predict` subcommand.
    pub fn record(&self) -> crate::Result<Option<CustomerRecord>> {
        match self {
            Command::Predict {
                json: Some(json), ..
            } => CustomerRecord::from_json(json).map(Some),
            Command::Predict { field, .. } if !field.is_empty() => parse_fields(field).map(Some),
            Command::Predict { .. } => {
                anyhow::bail!("Provide the customer with --json or one or more --field name=value")
            }
            _ => Ok(None),
        }
    }
}
