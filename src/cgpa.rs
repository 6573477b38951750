use serde::Serialize;
use std::collections::BTreeMap;

use crate::grading::round_off_2_decimals;
use crate::store::{Store, StoreError};

/// A grade from a PUBLISHED workflow, with the course's credit weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedGrade {
    pub course_id: String,
    pub semester: String,
    pub credit: f64,
    pub grade_point: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterGpa {
    pub semester: String,
    pub gpa: f64,
    pub credits: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CgpaSummary {
    pub student_id: String,
    pub cgpa: f64,
    pub cgpa_rounded: f64,
    pub total_credits: f64,
    pub course_count: usize,
    pub semesters: Vec<SemesterGpa>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    weighted: f64,
    credits: f64,
    count: usize,
}

impl Accum {
    fn add(&mut self, g: &PublishedGrade) {
        // Zero-credit and malformed rows carry no weight.
        if !g.credit.is_finite() || g.credit <= 0.0 || !g.grade_point.is_finite() {
            return;
        }
        self.weighted += g.grade_point * g.credit;
        self.credits += g.credit;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.credits > 0.0 {
            self.weighted / self.credits
        } else {
            0.0
        }
    }
}

/// Credit-weighted mean of grade points. 0 when nothing carries credit.
pub fn weighted_grade_point(grades: &[PublishedGrade]) -> f64 {
    let mut acc = Accum::default();
    for g in grades {
        acc.add(g);
    }
    acc.mean()
}

pub fn summarize(student_id: &str, grades: &[PublishedGrade]) -> CgpaSummary {
    let mut overall = Accum::default();
    let mut per_semester: BTreeMap<&str, Accum> = BTreeMap::new();
    for g in grades {
        overall.add(g);
        per_semester.entry(g.semester.as_str()).or_default().add(g);
    }
    let cgpa = overall.mean();
    CgpaSummary {
        student_id: student_id.to_string(),
        cgpa,
        cgpa_rounded: round_off_2_decimals(cgpa),
        total_credits: overall.credits,
        course_count: overall.count,
        semesters: per_semester
            .into_iter()
            .filter(|(_, acc)| acc.count > 0)
            .map(|(semester, acc)| SemesterGpa {
                semester: semester.to_string(),
                gpa: acc.mean(),
                credits: acc.credits,
            })
            .collect(),
    }
}

/// Recomputes from the store on every call; never writes.
pub fn calculate_cgpa(store: &dyn Store, student_id: &str) -> Result<CgpaSummary, StoreError> {
    let grades = store.published_grades(student_id)?;
    Ok(summarize(student_id, &grades))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(course: &str, semester: &str, credit: f64, gp: f64) -> PublishedGrade {
        PublishedGrade {
            course_id: course.to_string(),
            semester: semester.to_string(),
            credit,
            grade_point: gp,
        }
    }

    #[test]
    fn credit_weighted_mean() {
        let grades = vec![grade("c1", "S1", 3.0, 3.5), grade("c2", "S1", 4.0, 3.0)];
        let cgpa = weighted_grade_point(&grades);
        assert!((cgpa - (3.5 * 3.0 + 3.0 * 4.0) / 7.0).abs() < 1e-12);
        assert_eq!(summarize("s1", &grades).cgpa_rounded, 3.21);
    }

    #[test]
    fn no_credit_bearing_records_yields_zero() {
        assert_eq!(weighted_grade_point(&[]), 0.0);
        let s = summarize("s1", &[grade("seminar", "S1", 0.0, 4.0)]);
        assert_eq!(s.cgpa, 0.0);
        assert_eq!(s.course_count, 0);
        assert!(s.semesters.is_empty());
    }

    #[test]
    fn semesters_are_reported_in_order() {
        let grades = vec![
            grade("c3", "2024-2", 3.0, 2.0),
            grade("c1", "2024-1", 3.0, 4.0),
            grade("c2", "2024-1", 1.0, 2.0),
        ];
        let s = summarize("s1", &grades);
        assert_eq!(s.semesters.len(), 2);
        assert_eq!(s.semesters[0].semester, "2024-1");
        assert!((s.semesters[0].gpa - 3.5).abs() < 1e-12);
        assert_eq!(s.semesters[1].gpa, 2.0);
        assert_eq!(s.total_credits, 7.0);
    }
}
