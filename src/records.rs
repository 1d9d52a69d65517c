use lazy_static::lazy_static;
use polars::prelude::{DataFrame, DataType, Field, NamedFrom, PolarsResult, Schema, Series};
use serde::{Deserialize, Serialize};

use crate::error::{FieldIssue, InvalidRecord};

pub const ID_COLUMN: &str = "id";
pub const LABEL_COLUMN: &str = "stroke";
pub const BMI_COLUMN: &str = "bmi";

/// Marker the raw dataset uses for a BMI that was never measured.
pub const BMI_MISSING_MARKER: &str = "N/A";

/// Feature columns in the order the classifier was trained on.
pub const FEATURE_COLUMNS: [&str; 10] = [
    "gender",
    "age",
    "hypertension",
    "heart_disease",
    "ever_married",
    "work_type",
    "Residence_type",
    "avg_glucose_level",
    BMI_COLUMN,
    "smoking_status",
];

pub const CATEGORICAL_COLUMNS: [&str; 5] = [
    "gender",
    "ever_married",
    "work_type",
    "Residence_type",
    "smoking_status",
];

lazy_static! {
    pub static ref RAW_SCHEMA: Schema = StrokeRecord::raw_schema();
}

pub struct StrokeRecord {
}


impl StrokeRecord {
    /// Column types of the raw dataset file. BMI stays textual so the
    /// missing marker survives loading.
    pub fn raw_schema() -> Schema {
        Schema::from_iter(
            vec![
                Field::new(ID_COLUMN, DataType::Int32),
                Field::new("gender", DataType::Utf8),
                Field::new("age", DataType::Float64),
                Field::new("hypertension", DataType::Int32),
                Field::new("heart_disease", DataType::Int32),
                Field::new("ever_married", DataType::Utf8),
                Field::new("work_type", DataType::Utf8),
                Field::new("Residence_type", DataType::Utf8),
                Field::new("avg_glucose_level", DataType::Float64),
                Field::new(BMI_COLUMN, DataType::Utf8),
                Field::new("smoking_status", DataType::Utf8),
                Field::new(LABEL_COLUMN, DataType::Int32),
            ])
    }

}

/// Attributes a patient submits for a prediction. Carries neither the
/// dataset identifier nor the label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub gender: String,
    pub age: f64,
    pub hypertension: i32,
    pub heart_disease: i32,
    pub ever_married: String,
    pub work_type: String,
    #[serde(alias = "Residence_type")]
    pub residence_type: String,
    pub avg_glucose_level: f64,
    #[serde(default)]
    pub bmi: Option<f64>,
    pub smoking_status: String,
}

impl PatientRecord {
    /// Range checks on the numeric attributes. Category membership is left
    /// to the fitted encoders.
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        let mut issues = Vec::new();

        if !(0.0..=150.0).contains(&self.age) {
            issues.push(FieldIssue {
                field: "age",
                reason: format!("must be between 0 and 150, got {}", self.age),
            });
        }
        for (field, value) in [
            ("hypertension", self.hypertension),
            ("heart_disease", self.heart_disease),
        ] {
            if value != 0 && value != 1 {
                issues.push(FieldIssue {
                    field,
                    reason: format!("must be 0 or 1, got {}", value),
                });
            }
        }
        if !(self.avg_glucose_level.is_finite() && self.avg_glucose_level >= 0.0) {
            issues.push(FieldIssue {
                field: "avg_glucose_level",
                reason: format!("must be a non-negative number, got {}", self.avg_glucose_level),
            });
        }
        if let Some(bmi) = self.bmi {
            if !(0.0..=100.0).contains(&bmi) {
                issues.push(FieldIssue {
                    field: "bmi",
                    reason: format!("must be between 0 and 100, got {}", bmi),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(InvalidRecord { issues })
        }
    }

    /// Builds a table with one row per record, using the raw dataset's
    /// column names.
    pub fn to_frame(records: &[PatientRecord]) -> PolarsResult<DataFrame> {
        DataFrame::new(vec![
            text_column("gender", records, |r| r.gender.as_str()),
            Series::new("age", records.iter().map(|r| r.age).collect::<Vec<f64>>()),
            Series::new(
                "hypertension",
                records.iter().map(|r| r.hypertension).collect::<Vec<i32>>(),
            ),
            Series::new(
                "heart_disease",
                records.iter().map(|r| r.heart_disease).collect::<Vec<i32>>(),
            ),
            text_column("ever_married", records, |r| r.ever_married.as_str()),
            text_column("work_type", records, |r| r.work_type.as_str()),
            text_column("Residence_type", records, |r| r.residence_type.as_str()),
            Series::new(
                "avg_glucose_level",
                records.iter().map(|r| r.avg_glucose_level).collect::<Vec<f64>>(),
            ),
            Series::new(BMI_COLUMN, records.iter().map(|r| r.bmi).collect::<Vec<Option<f64>>>()),
            text_column("smoking_status", records, |r| r.smoking_status.as_str()),
        ])
    }
}

fn text_column(name: &str, records: &[PatientRecord], get: fn(&PatientRecord) -> &str) -> Series {
    Series::new(name, records.iter().map(get).collect::<Vec<&str>>())
}
