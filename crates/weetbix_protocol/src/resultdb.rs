//! Result source types (subset of `luci.resultdb.v1`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between project and sub-realm in a realm string.
pub const REALM_SEPARATOR: char = ':';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// `invocations/<id>`.
    pub name: String,
    /// `<project>:<sub-realm>`.
    #[serde(default)]
    pub realm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
}

impl Invocation {
    /// Invocation id with the `invocations/` prefix stripped.
    pub fn id(&self) -> &str {
        invocation_id_from_name(&self.name).unwrap_or(&self.name)
    }
}

/// Extract the id from `invocations/<id>`.
pub fn invocation_id_from_name(name: &str) -> Option<&str> {
    name.strip_prefix("invocations/").filter(|id| !id.is_empty())
}

/// Invocation that a test result belongs to, parsed from
/// `invocations/<inv>/tests/<test>/results/<result>`.
pub fn invocation_from_result_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("invocations/")?;
    let (inv, tail) = rest.split_once('/')?;
    if inv.is_empty() || !tail.starts_with("tests/") {
        return None;
    }
    Some(inv)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    #[default]
    StatusUnspecified,
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
    #[serde(other)]
    Unrecognized,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUnspecified => "STATUS_UNSPECIFIED",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Crash => "CRASH",
            Self::Abort => "ABORT",
            Self::Skip => "SKIP",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STATUS_UNSPECIFIED" => Some(Self::StatusUnspecified),
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "CRASH" => Some(Self::Crash),
            "ABORT" => Some(Self::Abort),
            "SKIP" => Some(Self::Skip),
            "UNRECOGNIZED" => Some(Self::Unrecognized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVariantStatus {
    #[default]
    TestVariantStatusUnspecified,
    Unexpected,
    UnexpectedlySkipped,
    Flaky,
    Exonerated,
    Expected,
    #[serde(other)]
    Unrecognized,
}

impl TestVariantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestVariantStatusUnspecified => "TEST_VARIANT_STATUS_UNSPECIFIED",
            Self::Unexpected => "UNEXPECTED",
            Self::UnexpectedlySkipped => "UNEXPECTEDLY_SKIPPED",
            Self::Flaky => "FLAKY",
            Self::Exonerated => "EXONERATED",
            Self::Expected => "EXPECTED",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEST_VARIANT_STATUS_UNSPECIFIED" => Some(Self::TestVariantStatusUnspecified),
            "UNEXPECTED" => Some(Self::Unexpected),
            "UNEXPECTEDLY_SKIPPED" => Some(Self::UnexpectedlySkipped),
            "FLAKY" => Some(Self::Flaky),
            "EXONERATED" => Some(Self::Exonerated),
            "EXPECTED" => Some(Self::Expected),
            "UNRECOGNIZED" => Some(Self::Unrecognized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExonerationReason {
    #[default]
    ExonerationReasonUnspecified,
    OccursOnMainline,
    #[serde(rename = "OCCURS_ON_OTHER_CLS")]
    OccursOnOtherCls,
    NotCritical,
    Unexpected,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exoneration {
    #[serde(default)]
    pub reason: ExonerationReason,
    #[serde(default)]
    pub explanation_html: String,
}

/// Key-value description of the configuration a test ran in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default)]
    pub def: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// `invocations/<inv>/tests/<test>/results/<result>`.
    pub name: String,
    #[serde(default)]
    pub result_id: String,
    #[serde(default)]
    pub expected: bool,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "duration",
        with = "crate::serde_util::duration_micros",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_micros: Option<i64>,
}

impl TestResult {
    pub fn invocation(&self) -> Option<&str> {
        invocation_from_result_name(&self.name)
    }

    /// An unexpected result other than a pass or skip.
    pub fn is_unexpected_failure(&self) -> bool {
        !self.expected && self.status != TestStatus::Pass && self.status != TestStatus::Skip
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultBundle {
    pub result: TestResult,
}

/// All results of one test in one configuration within an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestVariant {
    pub test_id: String,
    #[serde(default)]
    pub variant_hash: String,
    #[serde(default)]
    pub variant: Variant,
    #[serde(default)]
    pub status: TestVariantStatus,
    #[serde(default)]
    pub results: Vec<TestResultBundle>,
    #[serde(default)]
    pub exonerations: Vec<Exoneration>,
}

impl TestVariant {
    /// Whether any result failed unexpectedly. Variants that are expected
    /// or only unexpectedly skipped never qualify.
    pub fn has_unexpected_failures(&self) -> bool {
        if matches!(
            self.status,
            TestVariantStatus::Expected | TestVariantStatus::UnexpectedlySkipped
        ) {
            return false;
        }
        self.results.iter().any(|r| r.result.is_unexpected_failure())
    }

    /// Exoneration reasons, sorted and de-duplicated.
    pub fn exoneration_reasons(&self) -> Vec<ExonerationReason> {
        let mut reasons: Vec<_> = self.exonerations.iter().map(|e| e.reason).collect();
        reasons.sort();
        reasons.dedup();
        reasons
    }

    /// Variant hash as reported, or computed from the definition when the
    /// source left it empty.
    pub fn effective_variant_hash(&self) -> String {
        if self.variant_hash.is_empty() {
            crate::hashing::variant_hash(&self.variant.def)
        } else {
            self.variant_hash.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTestVariantsRequest {
    pub invocations: Vec<String>,
    pub page_size: u32,
    #[serde(default)]
    pub page_token: String,
    /// Comma separated field paths (protojson `FieldMask`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_mask: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTestVariantsResponse {
    #[serde(default)]
    pub test_variants: Vec<TestVariant>,
    /// Empty on the last page.
    #[serde(default)]
    pub next_page_token: String,
}
