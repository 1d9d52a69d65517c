//! Offline training: reads the raw dataset, fits the transform and the
//! forest on a stratified training split, evaluates on the held-out rows and
//! writes the artifact together with its metrics and golden fixture.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use polars::prelude::*;
use polars_io::parquet::ParquetReader;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use smartcore::metrics::accuracy;
use sysinfo::{ProcessExt, System, SystemExt};

use crate::error::{ModelError, PipelineError};
use crate::forest::{ForestParams, StrokeForest};
use crate::predictor::RiskPredictor;
use crate::records::{PatientRecord, LABEL_COLUMN, RAW_SCHEMA};
use crate::transform::{labels, FeatureMatrix, TransformState};

pub static MODEL_FILE_NAME: &str = "stroke_model.json";
pub static METRICS_FILE_NAME: &str = "model_metrics.txt";
pub static GOLDEN_FILE_NAME: &str = "golden.json";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset: PathBuf,
    pub output_dir: PathBuf,
    pub forest: ForestParams,
    pub test_size: f64,
    pub seed: u64,
    /// Oversample the minority class of the training split up to parity.
    pub balance: bool,
    /// Also write the transformed training table as CSV.
    pub export_features: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(dataset: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset: dataset.into(),
            output_dir: output_dir.into(),
            forest: ForestParams::default(),
            test_size: 0.2,
            seed: 42,
            balance: true,
            export_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// `[[tn, fp], [fn, tp]]`
    pub confusion_matrix: [[usize; 2]; 2],
}

impl Metrics {
    pub fn evaluate(y_true: &[i32], y_pred: &[i32]) -> Self {
        let mut cm = [[0usize; 2]; 2];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            cm[(t == 1) as usize][(p == 1) as usize] += 1;
        }
        let tp = cm[1][1] as f64;
        let fp = cm[0][1] as f64;
        let fneg = cm[1][0] as f64;

        let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fneg);
        let f1_score = ratio(2.0 * precision * recall, precision + recall);

        Self {
            accuracy: accuracy(&y_true.to_vec(), &y_pred.to_vec()),
            precision,
            recall,
            f1_score,
            confusion_matrix: cm,
        }
    }

    pub fn write_report(&self, path: &Path) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "Random Forest Model Evaluation Metrics")?;
        writeln!(file, "{}\n", "=".repeat(60))?;
        writeln!(file, "Accuracy:  {:.4}", self.accuracy)?;
        writeln!(file, "Precision: {:.4}", self.precision)?;
        writeln!(file, "Recall:    {:.4}", self.recall)?;
        writeln!(file, "F1-Score:  {:.4}", self.f1_score)?;
        writeln!(file, "Confusion matrix: {:?}", self.confusion_matrix)?;
        Ok(())
    }
}

/// Prediction for the reference patient, recorded when the artifact is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenFixture {
    pub record: PatientRecord,
    pub prediction: i32,
    pub probability: f64,
}

impl GoldenFixture {
    pub fn capture(predictor: &RiskPredictor) -> Result<Self, PipelineError> {
        let record = reference_patient();
        let prediction = predictor.predict(&record)?;
        Ok(Self {
            record,
            prediction: prediction.label,
            probability: prediction.probability,
        })
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|source| PipelineError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(file)?)
    }
}

pub fn reference_patient() -> PatientRecord {
    PatientRecord {
        gender: "Male".to_string(),
        age: 67.0,
        hypertension: 0,
        heart_disease: 1,
        ever_married: "Yes".to_string(),
        work_type: "Private".to_string(),
        residence_type: "Urban".to_string(),
        avg_glucose_level: 228.69,
        bmi: Some(36.6),
        smoking_status: "formerly smoked".to_string(),
    }
}

#[derive(Debug)]
pub struct TrainingReport {
    pub artifact: PathBuf,
    pub metrics: Metrics,
    /// `None` when the reference patient has a category the dataset lacks.
    pub golden: Option<GoldenFixture>,
    pub train_rows: usize,
    pub test_rows: usize,
}

pub fn read_parquet(path: &Path) -> Result<DataFrame, PipelineError> {
    let file = open(path)?;

    Ok(ParquetReader::new(file).finish()?)
}

pub fn read_csv(path: &Path) -> Result<DataFrame, PipelineError> {
    let file = open(path)?;

    Ok(CsvReader::new(file)
        .has_header(true)
        .with_dtypes(Some(Arc::new(RAW_SCHEMA.clone())))
        .finish()?)
}

fn open(path: &Path) -> Result<File, PipelineError> {
    File::open(path).map_err(|source| PipelineError::Input {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a CSV or Parquet dataset and drops rows without a label.
pub fn read_dataset(path: &Path) -> Result<DataFrame, PipelineError> {
    let df = match path.extension().and_then(|ext| ext.to_str()) {
        Some("parquet") => read_parquet(path)?,
        _ => read_csv(path)?,
    };
    let before = df.height();
    let df = df.lazy().filter(col(LABEL_COLUMN).is_not_null()).collect()?;
    if df.height() < before {
        log::warn!("dropped {} rows without a {} label", before - df.height(), LABEL_COLUMN);
    }
    Ok(df)
}

/// Splits row indices per class so both splits keep the class ratio.
/// Returns a mask that is `true` for test rows. A class with at least two
/// rows puts at least one in each split.
pub fn stratified_mask(labels: &[i32], test_size: f64, seed: u64) -> Result<Vec<bool>, PipelineError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(PipelineError::TestSize(test_size));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut mask = vec![false; labels.len()];
    for class in [0, 1] {
        let mut rows: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        rows.shuffle(&mut rng);
        let n_test = match rows.len() {
            0 | 1 => 0,
            n => ((n as f64 * test_size).round() as usize).clamp(1, n - 1),
        };
        for &row in rows.iter().take(n_test) {
            mask[row] = true;
        }
    }
    Ok(mask)
}

/// Random oversampling of the minority class until both classes have the
/// same number of rows.
pub fn oversample_minority(x: &FeatureMatrix, y: &[i32], seed: u64) -> (FeatureMatrix, Vec<i32>) {
    let positives: Vec<usize> = (0..y.len()).filter(|&i| y[i] == 1).collect();
    let negatives: Vec<usize> = (0..y.len()).filter(|&i| y[i] == 0).collect();
    let deficit = positives.len().abs_diff(negatives.len());
    let minority = if positives.len() < negatives.len() {
        positives
    } else {
        negatives
    };
    if minority.is_empty() || deficit == 0 {
        return (x.clone(), y.to_vec());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rows: Vec<usize> = (0..y.len()).collect();
    rows.extend((0..deficit).map(|_| minority[rng.gen_range(0..minority.len())]));

    let all_cols: Vec<usize> = (0..x.ncols()).collect();
    let labels = rows.iter().map(|&r| y[r]).collect();
    (x.select(&rows, &all_cols), labels)
}

pub fn write_features(
    path: &Path,
    names: &[String],
    x: &FeatureMatrix,
    y: &[i32],
) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = names.iter().map(String::as_str).collect();
    header.push(LABEL_COLUMN);
    writer.write_record(&header)?;
    for (row, label) in x.rows().zip(y) {
        let mut record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        record.push(label.to_string());
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|source| PipelineError::Output {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn class_counts(labels: &[i32]) -> (usize, usize) {
    let positives = labels.iter().filter(|&&l| l == 1).count();
    (positives, labels.len() - positives)
}

fn monitor_memory() -> u64 {
    let mut sys = System::new();
    match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_process(pid);
            sys.process(pid).map(|p| p.memory()).unwrap_or(0)
        }
        Err(_) => 0,
    }
}

pub fn train(config: &PipelineConfig) -> Result<TrainingReport, PipelineError> {
    let start_time = Instant::now();
    let start_memory = monitor_memory();

    let df = read_dataset(&config.dataset)?;
    log::info!("read {} rows from {}", df.height(), config.dataset.display());

    let all_labels = labels(&df)?;
    let (positives, negatives) = class_counts(&all_labels);
    if positives == 0 || negatives == 0 {
        return Err(PipelineError::SingleClass { positives, negatives });
    }

    let test_mask = stratified_mask(&all_labels, config.test_size, config.seed)?;
    let is_test = BooleanChunked::from_slice("test", &test_mask);
    let train_df = df.filter(&!&is_test)?;
    let test_df = df.filter(&is_test)?;
    if test_df.height() == 0 {
        return Err(PipelineError::NoTestRows(df.height()));
    }

    // category dictionaries see every labelled row, statistics only the training split
    let state = TransformState::fit_with_categories(&train_df, &df)?;
    let x_train = state.transform(&train_df)?;
    let y_train = labels(&train_df)?;
    if let Some(path) = &config.export_features {
        write_features(path, state.feature_names(), &x_train, &y_train)?;
        log::info!("wrote transformed training features to {}", path.display());
    }

    let (x_fit, y_fit) = if config.balance {
        oversample_minority(&x_train, &y_train, config.seed)
    } else {
        (x_train, y_train)
    };
    let (fit_pos, fit_neg) = class_counts(&y_fit);
    log::info!("training forest on {} rows ({} stroke, {} no stroke)", y_fit.len(), fit_pos, fit_neg);

    let forest = StrokeForest::fit(&x_fit, &y_fit, &config.forest)?;

    let x_test = state.transform(&test_df)?;
    let y_test = labels(&test_df)?;
    let y_pred = forest.predict(&x_test)?;
    let metrics = Metrics::evaluate(&y_test, &y_pred);
    log::info!(
        "accuracy {:.4}, precision {:.4}, recall {:.4}, f1 {:.4}",
        metrics.accuracy,
        metrics.precision,
        metrics.recall,
        metrics.f1_score
    );

    fs::create_dir_all(&config.output_dir).map_err(|source| PipelineError::Output {
        path: config.output_dir.clone(),
        source,
    })?;

    let predictor = RiskPredictor::new(state, forest);
    let golden = match GoldenFixture::capture(&predictor) {
        Ok(golden) => Some(golden),
        Err(PipelineError::Model(ModelError::Transform(e))) if e.is_validation() => {
            log::warn!("skipping golden fixture, reference patient cannot be encoded: {}", e);
            None
        }
        Err(e) => return Err(e),
    };

    let artifact = config.output_dir.join(MODEL_FILE_NAME);
    predictor.into_artifact().save(&artifact)?;

    let metrics_path = config.output_dir.join(METRICS_FILE_NAME);
    metrics
        .write_report(&metrics_path)
        .map_err(|source| PipelineError::Output {
            path: metrics_path.clone(),
            source,
        })?;

    let golden_path = config.output_dir.join(GOLDEN_FILE_NAME);
    let golden_error = |source| PipelineError::Output {
        path: golden_path.clone(),
        source,
    };
    match &golden {
        Some(golden) => {
            let golden_file = File::create(&golden_path).map_err(golden_error)?;
            serde_json::to_writer_pretty(golden_file, golden)?;
        }
        // a fixture from an earlier run would not match this artifact
        None if golden_path.exists() => fs::remove_file(&golden_path).map_err(golden_error)?,
        None => {}
    }

    let end_memory = monitor_memory();
    log::info!(
        "training finished in {:?}, memory grew by {} bytes",
        start_time.elapsed(),
        end_memory.saturating_sub(start_memory)
    );

    Ok(TrainingReport {
        artifact,
        metrics,
        golden,
        train_rows: train_df.height(),
        test_rows: test_df.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_from_confusion_counts() {
        let y_true = [1, 1, 1, 0, 0, 0, 0, 0];
        let y_pred = [1, 1, 0, 1, 0, 0, 0, 0];
        let m = Metrics::evaluate(&y_true, &y_pred);
        assert_eq!(m.confusion_matrix, [[4, 1], [1, 2]]);
        assert!((m.accuracy - 0.75).abs() < 1e-12);
        assert!((m.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.f1_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn stratified_split_keeps_ratio() {
        let labels: Vec<i32> = (0..100).map(|i| if i < 10 { 1 } else { 0 }).collect();
        let mask = stratified_mask(&labels, 0.2, 42).unwrap();
        let test_pos = labels.iter().zip(&mask).filter(|&(&l, &m)| m && l == 1).count();
        let test_neg = labels.iter().zip(&mask).filter(|&(&l, &m)| m && l == 0).count();
        assert_eq!((test_pos, test_neg), (2, 18));
        assert_eq!(mask, stratified_mask(&labels, 0.2, 42).unwrap());
        assert!(stratified_mask(&labels, 1.0, 42).is_err());
    }

    #[test]
    fn small_classes_keep_a_row_in_each_split() {
        let labels = [1, 1, 0, 0];
        let mask = stratified_mask(&labels, 0.2, 42).unwrap();
        for class in [0, 1] {
            let in_test = labels
                .iter()
                .zip(&mask)
                .filter(|&(&l, &m)| m && l == class)
                .count();
            assert_eq!(in_test, 1, "class {}", class);
        }

        let single = stratified_mask(&[1, 0, 0, 0, 0, 0], 0.2, 42).unwrap();
        assert!(!single[0]);
    }

    #[test]
    fn oversampling_balances_classes() {
        let x = FeatureMatrix::from_rows(
            &[vec![0.0], vec![1.0], vec![2.0], vec![3.0], vec![9.0]],
            1,
        )
        .unwrap();
        let y = [0, 0, 0, 0, 1];
        let (xb, yb) = oversample_minority(&x, &y, 1);
        assert_eq!(class_counts(&yb), (4, 4));
        assert_eq!(xb.nrows(), 8);
        for (row, label) in xb.rows().zip(&yb) {
            if *label == 1 {
                assert_eq!(row, &[9.0]);
            }
        }

        // negatives in the minority this time
        let y = [1, 1, 1, 0, 1];
        let (xb, yb) = oversample_minority(&x, &y, 1);
        assert_eq!(class_counts(&yb), (4, 4));
        for (row, label) in xb.rows().skip(5).zip(&yb[5..]) {
            assert_eq!(*label, 0);
            assert_eq!(row, &[3.0]);
        }
    }
}
