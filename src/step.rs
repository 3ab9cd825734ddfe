//! The fixed six-step pipeline sequence.
//!
//! Steps are totally ordered: a step's prerequisites are every step that
//! precedes it. The order also fixes the two-digit file prefix used for
//! frozen artifacts and the names of the prompt template pair per step.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the pipeline, in prerequisite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    #[serde(rename = "EPIC")]
    Epic,
    #[serde(rename = "FEATURES")]
    Features,
    #[serde(rename = "STORIES")]
    Stories,
    #[serde(rename = "TEST_PLAN")]
    TestPlan,
    #[serde(rename = "TEST_CASES")]
    TestCases,
    #[serde(rename = "AUTOMATED_TESTS")]
    AutomatedTests,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 6] = [
        Step::Epic,
        Step::Features,
        Step::Stories,
        Step::TestPlan,
        Step::TestCases,
        Step::AutomatedTests,
    ];

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        Step::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// The step immediately before this one, if any.
    pub fn prev(self) -> Option<Step> {
        self.index().checked_sub(1).map(|i| Step::ALL[i])
    }

    /// The step immediately after this one, if any.
    pub fn next(self) -> Option<Step> {
        Step::ALL.get(self.index() + 1).copied()
    }

    /// Every step strictly before this one, in order.
    pub fn prerequisites(self) -> &'static [Step] {
        &Step::ALL[..self.index()]
    }

    /// Fixed file prefix for this step's frozen artifact.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Step::Epic => "00_epic",
            Step::Features => "01_features",
            Step::Stories => "02_stories",
            Step::TestPlan => "03_test_plan",
            Step::TestCases => "04_test_cases",
            Step::AutomatedTests => "05_automated_tests",
        }
    }

    /// Names of the (system, user) prompt template files for this step.
    pub fn prompt_files(self) -> (&'static str, &'static str) {
        match self {
            Step::Epic => ("00_epic.system.txt", "00_epic.user.txt"),
            Step::Features => ("01_features.system.txt", "01_features.user.txt"),
            Step::Stories => ("02_stories.system.txt", "02_stories.user.txt"),
            Step::TestPlan => ("03_test_plan.system.txt", "03_test_plan.user.txt"),
            Step::TestCases => ("04_test_cases.system.txt", "04_test_cases.user.txt"),
            Step::AutomatedTests => (
                "05_automated_tests.system.txt",
                "05_automated_tests.user.txt",
            ),
        }
    }

    /// The canonical tag used in state documents and the CLI.
    pub fn tag(self) -> &'static str {
        match self {
            Step::Epic => "EPIC",
            Step::Features => "FEATURES",
            Step::Stories => "STORIES",
            Step::TestPlan => "TEST_PLAN",
            Step::TestCases => "TEST_CASES",
            Step::AutomatedTests => "AUTOMATED_TESTS",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_uppercase();
        Step::ALL
            .into_iter()
            .find(|step| step.tag() == tag)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid step: {}. Valid steps: {}",
                    s,
                    Step::ALL.map(|v| v.tag()).join(", ")
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order_is_total() {
        for pair in Step::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Step::ALL.len(), 6);
    }

    #[test]
    fn test_prev_next() {
        assert_eq!(Step::Epic.prev(), None);
        assert_eq!(Step::Features.prev(), Some(Step::Epic));
        assert_eq!(Step::AutomatedTests.next(), None);
        assert_eq!(Step::TestCases.next(), Some(Step::AutomatedTests));
    }

    #[test]
    fn test_prerequisites_are_strictly_before() {
        assert!(Step::Epic.prerequisites().is_empty());
        assert_eq!(
            Step::TestPlan.prerequisites(),
            &[Step::Epic, Step::Features, Step::Stories]
        );
        assert_eq!(Step::AutomatedTests.prerequisites().len(), 5);
    }

    #[test]
    fn test_file_prefixes_are_two_digit() {
        for (i, step) in Step::ALL.iter().enumerate() {
            assert!(step.file_prefix().starts_with(&format!("{:02}_", i)));
        }
    }

    #[test]
    fn test_from_str_accepts_canonical_tags() {
        assert_eq!("EPIC".parse::<Step>().unwrap(), Step::Epic);
        assert_eq!("test_plan".parse::<Step>().unwrap(), Step::TestPlan);
        assert_eq!(
            " automated_tests ".parse::<Step>().unwrap(),
            Step::AutomatedTests
        );
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        let err = "DEPLOY".parse::<Step>().unwrap_err();
        assert!(err.to_string().contains("Invalid step"));
    }

    #[test]
    fn test_serde_round_trip_as_tags() {
        let json = serde_json::to_string(&Step::TestCases).unwrap();
        assert_eq!(json, "\"TEST_CASES\"");
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Step::TestCases);
    }
}
