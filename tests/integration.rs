//! Integration tests for ChurnForge

use churnforge::data::{clean, read_table, split_features, CleanConfig, LabelPolicy};
use churnforge::inference::{ModelService, PREDICTION_COLUMN, PROBABILITY_COLUMN};
use churnforge::{
    load, predict_batch, predict_one, train, train_table, ChurnError, CustomerRecord, ModelArtifact,
    ParamGrid, TrainConfig, TrainReport, TELCO_FEATURE_COLUMNS,
};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::OnceLock;
use tempfile::NamedTempFile;

const ROWS: usize = 400;

/// Synthetic Telco-shaped CSV where contract, tenure, internet service and
/// payment method drive churn. Zero-tenure customers get a blank TotalCharges.
fn telco_csv(rows: usize, seed: u64, labels: (&str, &str)) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let yes_no = ["Yes", "No"];
    let mut csv = String::from("customerID,");
    csv.push_str(&TELCO_FEATURE_COLUMNS.join(","));
    csv.push_str(",Churn\n");

    for i in 0..rows {
        let tenure: u32 = rng.gen_range(0..=72);
        let contract = ["Month-to-month", "One year", "Two year"][rng.gen_range(0..3)];
        let internet = ["DSL", "Fiber optic", "No"][rng.gen_range(0..3)];
        let payment = [
            "Electronic check",
            "Mailed check",
            "Bank transfer (automatic)",
            "Credit card (automatic)",
        ][rng.gen_range(0..4)];
        let monthly: f64 = match internet {
            "Fiber optic" => rng.gen_range(70.0..110.0),
            "DSL" => rng.gen_range(40.0..70.0),
            _ => rng.gen_range(18.0..30.0),
        };
        let total = if tenure == 0 {
            " ".to_string()
        } else {
            format!("{:.2}", monthly * tenure as f64)
        };

        let mut score = -1.0;
        score += match contract {
            "Month-to-month" => 2.0,
            "One year" => 0.0,
            _ => -2.0,
        };
        if tenure < 12 {
            score += 1.5;
        } else if tenure > 48 {
            score -= 1.5;
        }
        if internet == "Fiber optic" {
            score += 1.0;
        }
        if payment == "Electronic check" {
            score += 1.0;
        }
        let p = 1.0 / (1.0 + f64::exp(-score));
        let churn = if rng.gen::<f64>() < p { labels.0 } else { labels.1 };

        let mut pick = || yes_no[rng.gen_range(0..2)];
        let row = [
            format!("{:04}-SYNTH", i),
            ["Male", "Female"][i % 2].to_string(),
            (if i % 5 == 0 { "1" } else { "0" }).to_string(),
            pick().to_string(),
            pick().to_string(),
            tenure.to_string(),
            pick().to_string(),
            pick().to_string(),
            internet.to_string(),
            pick().to_string(),
            pick().to_string(),
            pick().to_string(),
            pick().to_string(),
            pick().to_string(),
            pick().to_string(),
            contract.to_string(),
            pick().to_string(),
            payment.to_string(),
            format!("{:.2}", monthly),
            total,
            churn.to_string(),
        ];
        csv.push_str(&row.join(","));
        csv.push('\n');
    }
    csv
}

fn write_csv(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn telco_table(rows: usize, seed: u64, labels: (&str, &str)) -> DataFrame {
    let file = write_csv(&telco_csv(rows, seed, labels));
    read_table(file.path()).unwrap()
}

fn test_config() -> TrainConfig {
    TrainConfig {
        grid: ParamGrid {
            n_estimators: vec![10, 20],
            max_depth: vec![Some(4), None],
        },
        ..TrainConfig::default()
    }
}

/// One trained model shared by every test in this binary.
fn trained() -> &'static (ModelArtifact, TrainReport) {
    static TRAINED: OnceLock<(ModelArtifact, TrainReport)> = OnceLock::new();
    TRAINED.get_or_init(|| {
        let table = telco_table(ROWS, 7, ("Yes", "No"));
        train_table(&table, &test_config()).unwrap()
    })
}

fn customer(contract: &str, tenure: f64, internet: &str, payment: &str, monthly: f64) -> CustomerRecord {
    CustomerRecord::new()
        .with("gender", "Female")
        .with("SeniorCitizen", 0.0)
        .with("Partner", "No")
        .with("Dependents", "No")
        .with("tenure", tenure)
        .with("PhoneService", "Yes")
        .with("MultipleLines", "No")
        .with("InternetService", internet)
        .with("OnlineSecurity", "No")
        .with("OnlineBackup", "No")
        .with("DeviceProtection", "No")
        .with("TechSupport", "No")
        .with("StreamingTV", "No")
        .with("StreamingMovies", "No")
        .with("Contract", contract)
        .with("PaperlessBilling", "Yes")
        .with("PaymentMethod", payment)
        .with("MonthlyCharges", monthly)
        .with("TotalCharges", monthly * tenure)
}

fn churn_error(err: &anyhow::Error) -> &ChurnError {
    err.downcast_ref::<ChurnError>()
        .unwrap_or_else(|| panic!("expected a ChurnError, got: {err:#}"))
}

#[test]
fn test_train_from_file_and_save() {
    let data = write_csv(&telco_csv(ROWS, 7, ("Yes", "No")));
    let dir = tempfile::tempdir().unwrap();
    let model_out = dir.path().join("models").join("churn_model.pkl");

    let config = TrainConfig {
        data_path: data.path().to_path_buf(),
        model_out: model_out.clone(),
        ..test_config()
    };
    let report = train(&config).unwrap();

    assert!(model_out.exists());
    assert!(load(&model_out).unwrap().is_some());

    // Zero-tenure rows have a blank TotalCharges and are dropped.
    assert!(report.n_rows < ROWS);
    assert_eq!(report.n_rows, report.n_train + report.n_test);
    assert_eq!(report.candidates.len(), 4);
    assert!(report.roc_auc > 0.6, "holdout ROC AUC {}", report.roc_auc);
    assert!(report.accuracy > 0.5);
}

#[test]
fn test_identifier_and_target_are_not_features() {
    let (artifact, _) = trained();
    let required = artifact.required_columns();

    assert_eq!(required.len(), TELCO_FEATURE_COLUMNS.len());
    for column in TELCO_FEATURE_COLUMNS {
        assert!(required.iter().any(|c| c == column), "missing {column}");
    }
    assert!(!required.iter().any(|c| c == "customerID" || c == "Churn"));
}

#[test]
fn test_stratified_holdout_preserves_churn_rate() {
    let (_, report) = trained();
    assert!(
        (report.train_churn_rate - report.test_churn_rate).abs() <= 0.02,
        "train {} vs holdout {}",
        report.train_churn_rate,
        report.test_churn_rate
    );
    assert!((report.n_test as f64 / report.n_rows as f64 - 0.2).abs() < 0.01);
}

#[test]
fn test_training_is_deterministic() {
    let table = telco_table(ROWS, 7, ("Yes", "No"));
    let (again, report) = train_table(&table, &test_config()).unwrap();
    let (artifact, first_report) = trained();

    assert_eq!(again.transformation, artifact.transformation);
    assert_eq!(again.classifier, artifact.classifier);
    assert_eq!(report.best_params, first_report.best_params);
    assert_eq!(report.roc_auc, first_report.roc_auc);
}

#[test]
fn test_saved_model_round_trip() {
    let (artifact, _) = trained();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("churn_model.pkl");
    artifact.save(&path).unwrap();

    let loaded = load(&path).unwrap().unwrap();
    assert_eq!(&loaded, artifact);

    let table = telco_table(50, 99, ("Yes", "No"));
    let before = predict_batch(artifact, &table).unwrap();
    let after = predict_batch(&loaded, &table).unwrap();
    assert!(before.equals_missing(&after));

    let record = customer("Month-to-month", 3.0, "Fiber optic", "Electronic check", 95.0);
    assert_eq!(
        predict_one(artifact, &record).unwrap(),
        predict_one(&loaded, &record).unwrap()
    );
}

#[test]
fn test_batch_predictions_are_consistent() {
    let (artifact, _) = trained();
    let table = telco_table(60, 11, ("Yes", "No"));
    let scored = predict_batch(artifact, &table).unwrap();

    assert_eq!(scored.height(), table.height());
    assert_eq!(scored.width(), table.width() + 2);
    // Extra columns come through untouched.
    assert!(scored
        .column("customerID")
        .unwrap()
        .as_materialized_series()
        .equals_missing(table.column("customerID").unwrap().as_materialized_series()));

    let labels = scored.column(PREDICTION_COLUMN).unwrap().as_materialized_series().clone();
    let probs = scored.column(PROBABILITY_COLUMN).unwrap().as_materialized_series().clone();
    for (label, prob) in labels.i32().unwrap().into_iter().zip(probs.f64().unwrap()) {
        let (label, prob) = (label.unwrap(), prob.unwrap());
        assert!((0.0..=100.0).contains(&prob));
        if (prob - 50.0).abs() > 0.01 {
            assert_eq!(label == 1, prob >= 50.0, "label {label} for {prob}%");
        }
    }
}

#[test]
fn test_batch_rejects_text_in_numeric_column() {
    let (artifact, _) = trained();
    let csv: Vec<String> = telco_csv(20, 3, ("Yes", "No"))
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i != 4 {
                return line.to_string();
            }
            let mut fields: Vec<&str> = line.split(',').collect();
            fields[5] = "twelve";
            fields.join(",")
        })
        .collect();
    let file = write_csv(&(csv.join("\n") + "\n"));
    let table = read_table(file.path()).unwrap();

    let err = predict_batch(artifact, &table).unwrap_err();
    assert!(matches!(
        churn_error(&err),
        ChurnError::NonNumericValue { column, value } if column == "tenure" && value == "twelve"
    ));
}

#[test]
fn test_batch_reports_missing_columns() {
    let (artifact, _) = trained();
    let table = telco_table(20, 3, ("Yes", "No"));
    let table = table.drop("tenure").unwrap().drop("Contract").unwrap();

    let err = predict_batch(artifact, &table).unwrap_err();
    match churn_error(&err) {
        ChurnError::MissingColumns(columns) => {
            assert_eq!(columns, &vec!["tenure".to_string(), "Contract".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_single_prediction_field_validation() {
    let (artifact, _) = trained();

    let mut incomplete = customer("One year", 24.0, "DSL", "Mailed check", 55.0);
    incomplete.remove("PaymentMethod");
    let err = predict_one(artifact, &incomplete).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::MissingColumns(c) if c == &vec!["PaymentMethod".to_string()]));

    let extra = customer("One year", 24.0, "DSL", "Mailed check", 55.0).with("favouriteColour", "blue");
    let err = predict_one(artifact, &extra).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::UnexpectedFields(_)));
}

#[test]
fn test_unknown_category_is_scored() {
    let (artifact, _) = trained();
    let record = customer("Month-to-month", 10.0, "DSL", "Crypto wallet", 60.0);
    let prediction = predict_one(artifact, &record).unwrap();
    assert!((0.0..=1.0).contains(&prediction.probability));
}

#[test]
fn test_high_risk_customer_scores_above_low_risk() {
    let (artifact, _) = trained();
    let high = customer("Month-to-month", 1.0, "Fiber optic", "Electronic check", 100.0);
    let low = customer("Two year", 70.0, "DSL", "Credit card (automatic)", 50.0);

    let high = predict_one(artifact, &high).unwrap();
    let low = predict_one(artifact, &low).unwrap();
    assert!(
        high.probability > low.probability,
        "high {} vs low {}",
        high.probability,
        low.probability
    );
}

#[test]
fn test_model_service_without_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let service = ModelService::new(dir.path().join("absent.pkl"));
    let record = customer("Two year", 70.0, "DSL", "Mailed check", 50.0);
    assert!(service.predict_one(&record).unwrap().is_none());
}

#[test]
fn test_label_tokens_are_normalized() {
    let canonical = telco_table(100, 5, ("Yes", "No"));
    let shouting = telco_table(100, 5, (" YES ", "no"));
    let config = CleanConfig::default();

    let (_, expected) =
        split_features(&clean(&canonical, &config).unwrap(), "Churn", LabelPolicy::Strict).unwrap();
    let (_, actual) =
        split_features(&clean(&shouting, &config).unwrap(), "Churn", LabelPolicy::Strict).unwrap();
    assert_eq!(expected, actual);
}

#[test]
fn test_strict_labels_reject_unknown_tokens() {
    let table = telco_table(100, 5, ("Yes", "maybe"));
    let config = TrainConfig {
        labels: LabelPolicy::Strict,
        ..test_config()
    };
    let err = train_table(&table, &config).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::UnrecognizedLabel(t) if t == "maybe"));
}

#[test]
fn test_empty_training_set() {
    let file = write_csv("customerID,tenure,Contract,TotalCharges,Churn\nA,0,Two year, ,No\nB,0,One year, ,Yes\n");
    let table = read_table(file.path()).unwrap();
    let err = train_table(&table, &test_config()).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::EmptyTrainingSet));
}

#[test]
fn test_single_class_training_set() {
    let table = telco_table(100, 5, ("No", "No"));
    let err = train_table(&table, &test_config()).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::SingleClass { class: 0 }));
}

#[test]
fn test_missing_target_column() {
    let table = telco_table(50, 5, ("Yes", "No"));
    let config = TrainConfig {
        target_column: "Exited".to_string(),
        ..test_config()
    };
    let err = train_table(&table, &config).unwrap_err();
    assert!(matches!(churn_error(&err), ChurnError::MissingTarget(c) if c == "Exited"));
}
