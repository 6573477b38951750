use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rounds to 2 decimals, half away from zero.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseType {
    Theory,
    Lab,
    Combined,
}

impl CourseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CourseType::Theory => "theory",
            CourseType::Lab => "lab",
            CourseType::Combined => "combined",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "theory" => Some(CourseType::Theory),
            "lab" => Some(CourseType::Lab),
            "combined" => Some(CourseType::Combined),
            _ => None,
        }
    }
}

/// Absent, negative and non-finite marks all count as 0.
fn component(v: Option<f64>) -> f64 {
    v.filter(|x| x.is_finite()).unwrap_or(0.0).max(0.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TheoryMarks {
    #[serde(default)]
    pub attendance: Option<f64>,
    #[serde(default)]
    pub midterm: Option<f64>,
    #[serde(default)]
    pub continuous_assessment: Option<f64>,
    #[serde(default)]
    pub final_exam: Option<f64>,
}

impl TheoryMarks {
    pub fn sum(&self) -> f64 {
        component(self.attendance)
            + component(self.midterm)
            + component(self.continuous_assessment)
            + component(self.final_exam)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabMarks {
    #[serde(default)]
    pub lab_reports: Option<f64>,
    #[serde(default)]
    pub attendance: Option<f64>,
    #[serde(default)]
    pub final_lab: Option<f64>,
}

impl LabMarks {
    pub fn sum(&self) -> f64 {
        component(self.lab_reports) + component(self.attendance) + component(self.final_lab)
    }
}

/// Raw marks for one student in one course. The variant must match the
/// course's [`CourseType`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentMarks {
    Theory(TheoryMarks),
    Lab(LabMarks),
    Combined { theory: TheoryMarks, lab: LabMarks },
}

impl ComponentMarks {
    /// Marks with every component absent.
    pub fn empty(course_type: CourseType) -> Self {
        match course_type {
            CourseType::Theory => ComponentMarks::Theory(TheoryMarks::default()),
            CourseType::Lab => ComponentMarks::Lab(LabMarks::default()),
            CourseType::Combined => ComponentMarks::Combined {
                theory: TheoryMarks::default(),
                lab: LabMarks::default(),
            },
        }
    }

    pub fn course_type(&self) -> CourseType {
        match self {
            ComponentMarks::Theory(_) => CourseType::Theory,
            ComponentMarks::Lab(_) => CourseType::Lab,
            ComponentMarks::Combined { .. } => CourseType::Combined,
        }
    }

    pub fn raw_sum(&self) -> f64 {
        match self {
            ComponentMarks::Theory(t) => t.sum(),
            ComponentMarks::Lab(l) => l.sum(),
            ComponentMarks::Combined { theory, lab } => theory.sum() + lab.sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScaleEntry {
    pub min_threshold: f64,
    pub letter_grade: String,
    pub grade_point: f64,
}

impl GradingScaleEntry {
    fn new(min_threshold: f64, letter_grade: &str, grade_point: f64) -> Self {
        Self {
            min_threshold,
            letter_grade: letter_grade.to_string(),
            grade_point,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScaleError {
    #[error("grading scale must not be empty")]
    Empty,
    #[error("grading scale entry {index} is invalid: {reason}")]
    BadEntry { index: usize, reason: String },
    #[error("grading scale thresholds overlap at {threshold}")]
    Overlap { threshold: f64 },
    #[error("grading scale must start at 0, lowest threshold is {lowest}")]
    Uncovered { lowest: f64 },
}

/// Letter-grade table, held in descending threshold order. The lowest
/// threshold is always 0, so every non-negative percentage matches exactly
/// one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GradingScaleEntry>", into = "Vec<GradingScaleEntry>")]
pub struct GradingScale {
    entries: Vec<GradingScaleEntry>,
}

impl GradingScale {
    pub fn new(mut entries: Vec<GradingScaleEntry>) -> Result<Self, ScaleError> {
        if entries.is_empty() {
            return Err(ScaleError::Empty);
        }
        for (index, e) in entries.iter().enumerate() {
            let reason = if !e.min_threshold.is_finite() || e.min_threshold < 0.0 {
                Some("minThreshold must be a non-negative number")
            } else if e.min_threshold > 100.0 {
                Some("minThreshold must not exceed 100")
            } else if !e.grade_point.is_finite() || e.grade_point < 0.0 {
                Some("gradePoint must be a non-negative number")
            } else if e.letter_grade.trim().is_empty() {
                Some("letterGrade must not be empty")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ScaleError::BadEntry {
                    index,
                    reason: reason.to_string(),
                });
            }
        }
        entries.sort_by(|a, b| b.min_threshold.total_cmp(&a.min_threshold));
        for pair in entries.windows(2) {
            if pair[0].min_threshold == pair[1].min_threshold {
                return Err(ScaleError::Overlap {
                    threshold: pair[0].min_threshold,
                });
            }
        }
        let lowest = entries[entries.len() - 1].min_threshold;
        if lowest != 0.0 {
            return Err(ScaleError::Uncovered { lowest });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GradingScaleEntry] {
        &self.entries
    }

    /// First entry (descending) whose threshold is at or below `percentage`.
    pub fn lookup(&self, percentage: f64) -> &GradingScaleEntry {
        self.entries
            .iter()
            .find(|e| e.min_threshold <= percentage)
            .unwrap_or(&self.entries[self.entries.len() - 1])
    }
}

impl TryFrom<Vec<GradingScaleEntry>> for GradingScale {
    type Error = ScaleError;

    fn try_from(entries: Vec<GradingScaleEntry>) -> Result<Self, Self::Error> {
        GradingScale::new(entries)
    }
}

impl From<GradingScale> for Vec<GradingScaleEntry> {
    fn from(scale: GradingScale) -> Self {
        scale.entries
    }
}

impl Default for GradingScale {
    fn default() -> Self {
        Self {
            entries: vec![
                GradingScaleEntry::new(80.0, "A+", 4.00),
                GradingScaleEntry::new(75.0, "A", 3.75),
                GradingScaleEntry::new(70.0, "A-", 3.50),
                GradingScaleEntry::new(65.0, "B+", 3.25),
                GradingScaleEntry::new(60.0, "B", 3.00),
                GradingScaleEntry::new(55.0, "B-", 2.75),
                GradingScaleEntry::new(50.0, "C+", 2.50),
                GradingScaleEntry::new(45.0, "C", 2.25),
                GradingScaleEntry::new(40.0, "D", 2.00),
                GradingScaleEntry::new(0.0, "F", 0.00),
            ],
        }
    }
}

/// Maximum obtainable total per course type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseWeights {
    pub theory_max: f64,
    pub lab_max: f64,
    pub combined_max: f64,
}

impl Default for CourseWeights {
    fn default() -> Self {
        Self {
            theory_max: 100.0,
            lab_max: 100.0,
            combined_max: 200.0,
        }
    }
}

impl CourseWeights {
    pub fn max_for(&self, course_type: CourseType) -> f64 {
        match course_type {
            CourseType::Theory => self.theory_max,
            CourseType::Lab => self.lab_max,
            CourseType::Combined => self.combined_max,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("theoryMax", self.theory_max),
            ("labMax", self.lab_max),
            ("combinedMax", self.combined_max),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(format!("{} must be a positive number", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOutcome {
    pub total_marks: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub grade_point: f64,
}

/// Pure marks → grade computation over a fixed scale and weight table.
#[derive(Debug, Clone, Default)]
pub struct GradeAggregator {
    scale: GradingScale,
    weights: CourseWeights,
}

impl GradeAggregator {
    pub fn new(scale: GradingScale, weights: CourseWeights) -> Self {
        Self { scale, weights }
    }

    pub fn scale(&self) -> &GradingScale {
        &self.scale
    }

    pub fn weights(&self) -> &CourseWeights {
        &self.weights
    }

    pub fn compute(&self, marks: &ComponentMarks) -> GradeOutcome {
        let max_possible = self.weights.max_for(marks.course_type());
        let total_marks = round_off_2_decimals(marks.raw_sum().clamp(0.0, max_possible));
        let percentage = if max_possible > 0.0 {
            100.0 * total_marks / max_possible
        } else {
            0.0
        };
        let entry = self.scale.lookup(percentage);
        GradeOutcome {
            total_marks,
            percentage,
            letter_grade: entry.letter_grade.clone(),
            grade_point: entry.grade_point,
        }
    }
}
