pub mod loaders;
pub mod record;
pub mod submission;
pub mod test_case;

pub use loaders::{load_test_cases, TestCaseStore};
pub use record::{
    BuildResult, ErrorStage, GradingRecord, OutcomeCategory, OutcomeTally, RecordStatus, ScoreSource,
    TestOutcome, UnitError, Verdict,
};
pub use submission::{Language, Submission, UnitId};
pub use test_case::TestCase;
